pub mod joint;
pub mod marginal;
