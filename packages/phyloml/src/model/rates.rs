use crate::make_error;
use eyre::Report;

/// Discrete rate-heterogeneity model: a set of rate categories with
/// proportions, plus an invariant-site proportion. Category proportions and
/// `p_invar` together sum to 1.
#[derive(Clone, Debug)]
pub struct RateModel {
  rates: Vec<f64>,
  proportions: Vec<f64>,
  p_invar: f64,
}

impl RateModel {
  pub fn new(rates: Vec<f64>, proportions: Vec<f64>, p_invar: f64) -> Result<Self, Report> {
    if rates.is_empty() || rates.len() != proportions.len() {
      return make_error!(
        "Rate model needs one proportion per category, got {} rates and {} proportions",
        rates.len(),
        proportions.len()
      );
    }
    if rates.iter().any(|&r| r <= 0.0) {
      return make_error!("Rate categories must be positive");
    }
    if !(0.0..1.0).contains(&p_invar) {
      return make_error!("Invariant-site proportion must be in [0, 1), got {p_invar}");
    }
    let total: f64 = proportions.iter().sum::<f64>() + p_invar;
    if (total - 1.0).abs() > 1e-8 {
      return make_error!("Category proportions and p_invar must sum to 1, got {total}");
    }
    Ok(Self {
      rates,
      proportions,
      p_invar,
    })
  }

  /// Single category, rate 1, no invariant sites
  pub fn uniform() -> Self {
    Self {
      rates: vec![1.0],
      proportions: vec![1.0],
      p_invar: 0.0,
    }
  }

  /// Moves `p_invar` probability mass into the invariant class and rescales
  /// the remaining categories so the mean rate stays 1
  pub fn with_invariant(self, p_invar: f64) -> Result<Self, Report> {
    if self.p_invar != 0.0 {
      return make_error!("Rate model already has an invariant-site class");
    }
    if !(0.0..1.0).contains(&p_invar) {
      return make_error!("Invariant-site proportion must be in [0, 1), got {p_invar}");
    }
    let scale = 1.0 - p_invar;
    let rates = self.rates.iter().map(|r| r / scale).collect();
    let proportions = self.proportions.iter().map(|p| p * scale).collect();
    Self::new(rates, proportions, p_invar)
  }

  #[inline]
  pub fn n_categories(&self) -> usize {
    self.rates.len()
  }

  #[inline]
  pub fn rate(&self, category: usize) -> f64 {
    self.rates[category]
  }

  #[inline]
  pub fn proportion(&self, category: usize) -> f64 {
    self.proportions[category]
  }

  #[inline]
  pub const fn p_invar(&self) -> f64 {
    self.p_invar
  }
}
