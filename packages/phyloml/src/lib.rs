pub mod alphabet;
pub mod ancestral;
pub mod constants;
pub mod kernel;
pub mod likelihood;
pub mod model;
pub mod pattern;
pub mod tree;
pub mod utils;
