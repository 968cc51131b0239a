pub mod rates;
pub mod substitution;
