use crate::alphabet::alphabet::Alphabet;
use crate::kernel::ModelShape;
use crate::{make_error, make_internal_error};
use eyre::Report;
use ndarray::prelude::*;

/// Reversible substitution model given by its spectral decomposition,
/// optionally a mixture of several components sharing one alphabet and one
/// stationary distribution.
///
/// The decomposition must come from the standard symmetrization
/// `A = diag(sqrt(pi)) Q diag(1/sqrt(pi))`, so that `v_inv = v^T diag(pi)`.
/// The likelihood evaluator relies on this identity when it contracts two
/// partial-likelihood vectors in the eigenbasis.
#[derive(Clone, Debug)]
pub struct SubstitutionModel {
  alphabet: Alphabet,
  /// One entry per mixture component
  eigvals: Vec<Array1<f64>>,
  evecs: Vec<Array2<f64>>,
  inv_evecs: Vec<Array2<f64>>,
  pi: Array1<f64>,
  mixture_weights: Vec<f64>,
  /// Per-site heterogeneous models have no fixed state count a kernel could
  /// be specialized for; the selector binds the scalar table for them.
  site_specific: bool,
}

impl SubstitutionModel {
  pub fn from_eigen(
    alphabet: Alphabet,
    eigvals: Array1<f64>,
    evec: Array2<f64>,
    inv_evec: Array2<f64>,
    pi: Array1<f64>,
  ) -> Result<Self, Report> {
    let n = alphabet.n_states();
    if eigvals.len() != n || evec.shape() != [n, n] || inv_evec.shape() != [n, n] || pi.len() != n {
      return make_error!("Eigen-decomposition dimensions do not match the alphabet's {n} states");
    }
    let ident = evec.dot(&inv_evec);
    for i in 0..n {
      for j in 0..n {
        let expected = if i == j { 1.0 } else { 0.0 };
        if (ident[[i, j]] - expected).abs() > 1e-8 {
          return make_internal_error!("Eigenvector matrix and its inverse are inconsistent at ({i}, {j})");
        }
      }
    }
    if (pi.sum() - 1.0).abs() > 1e-8 {
      return make_error!("Stationary frequencies must sum to 1, got {}", pi.sum());
    }
    Ok(Self {
      alphabet,
      eigvals: vec![eigvals],
      evecs: vec![evec],
      inv_evecs: vec![inv_evec],
      pi,
      mixture_weights: vec![1.0],
      site_specific: false,
    })
  }

  /// Jukes-Cantor 1969: equal rates, uniform frequencies. The decomposition
  /// is analytic (orthonormal Helmert contrasts under the uniform measure),
  /// normalized to one expected substitution per unit branch length.
  pub fn jc69() -> Self {
    let alphabet = Alphabet::dna();
    let eigvals = array![0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0];
    // Orthonormal eigenvectors of the symmetrized matrix
    let s2 = std::f64::consts::SQRT_2;
    let s6 = 6.0_f64.sqrt();
    let s12 = 12.0_f64.sqrt();
    let u = array![
      [0.5, 1.0 / s2, 1.0 / s6, 1.0 / s12],
      [0.5, -1.0 / s2, 1.0 / s6, 1.0 / s12],
      [0.5, 0.0, -2.0 / s6, 1.0 / s12],
      [0.5, 0.0, 0.0, -3.0 / s12],
    ];
    // v = diag(1/sqrt(pi)) u, v_inv = u^T diag(sqrt(pi)), pi = 1/4
    let evec = &u * 2.0;
    let inv_evec = u.t().to_owned() * 0.5;
    let pi = Array1::from_elem(4, 0.25);
    Self::from_eigen(alphabet, eigvals, evec, inv_evec, pi).expect("JC69 eigen-decomposition is valid")
  }

  /// Symmetric two-state model, `pi = (1/2, 1/2)`, unit substitution rate
  pub fn symmetric_binary() -> Self {
    Self::two_state(0.5).expect("Symmetric binary model is valid")
  }

  /// General reversible two-state model with stationary frequency `pi0` of
  /// state 0, normalized to one expected substitution per unit branch length
  pub fn two_state(pi0: f64) -> Result<Self, Report> {
    if !(0.0..1.0).contains(&pi0) || pi0 == 0.0 {
      return make_error!("Stationary frequency must be strictly between 0 and 1, got {pi0}");
    }
    let pi1 = 1.0 - pi0;
    let rate = 1.0 / (2.0 * pi0 * pi1);
    let eigvals = array![0.0, -rate];
    let evec = array![[1.0, (pi1 / pi0).sqrt()], [1.0, -(pi0 / pi1).sqrt()]];
    let inv_evec = array![[pi0, pi1], [(pi0 * pi1).sqrt(), -(pi0 * pi1).sqrt()]];
    let pi = array![pi0, pi1];
    Self::from_eigen(Alphabet::binary(), eigvals, evec, inv_evec, pi)
  }

  /// Combines single-component models into one mixture model. All components
  /// must share the alphabet and the stationary distribution.
  pub fn mixture(components: Vec<SubstitutionModel>, weights: Vec<f64>) -> Result<Self, Report> {
    if components.is_empty() || components.len() != weights.len() {
      return make_error!(
        "Mixture needs one weight per component, got {} components and {} weights",
        components.len(),
        weights.len()
      );
    }
    let weight_sum: f64 = weights.iter().sum();
    if (weight_sum - 1.0).abs() > 1e-8 {
      return make_error!("Mixture weights must sum to 1, got {weight_sum}");
    }
    let first = &components[0];
    let n = first.n_states();
    for component in &components[1..] {
      if component.n_states() != n || component.n_mixtures() != 1 {
        return make_error!("Mixture components must be single-component models over the same alphabet");
      }
      if component.pi.iter().zip(first.pi.iter()).any(|(a, b)| (a - b).abs() > 1e-8) {
        return make_error!("Mixture components must share stationary frequencies");
      }
    }
    let alphabet = first.alphabet.clone();
    let pi = first.pi.clone();
    let (mut eigvals, mut evecs, mut inv_evecs) = (Vec::new(), Vec::new(), Vec::new());
    for mut component in components {
      eigvals.push(component.eigvals.remove(0));
      evecs.push(component.evecs.remove(0));
      inv_evecs.push(component.inv_evecs.remove(0));
    }
    Ok(Self {
      alphabet,
      eigvals,
      evecs,
      inv_evecs,
      pi,
      mixture_weights: weights,
      site_specific: false,
    })
  }

  /// Same model sped up or slowed down by a constant factor
  #[must_use]
  pub fn with_rate(mut self, factor: f64) -> Self {
    for eigvals in &mut self.eigvals {
      eigvals.mapv_inplace(|x| x * factor);
    }
    self
  }

  #[must_use]
  pub fn into_site_specific(mut self) -> Self {
    self.site_specific = true;
    self
  }

  #[inline]
  pub const fn alphabet(&self) -> &Alphabet {
    &self.alphabet
  }

  #[inline]
  pub fn n_states(&self) -> usize {
    self.alphabet.n_states()
  }

  #[inline]
  pub fn n_mixtures(&self) -> usize {
    self.eigvals.len()
  }

  #[inline]
  pub fn eigvals(&self, mixture: usize) -> &Array1<f64> {
    &self.eigvals[mixture]
  }

  #[inline]
  pub fn evec(&self, mixture: usize) -> &Array2<f64> {
    &self.evecs[mixture]
  }

  #[inline]
  pub fn inv_evec(&self, mixture: usize) -> &Array2<f64> {
    &self.inv_evecs[mixture]
  }

  #[inline]
  pub const fn pi(&self) -> &Array1<f64> {
    &self.pi
  }

  #[inline]
  pub fn mixture_weight(&self, mixture: usize) -> f64 {
    self.mixture_weights[mixture]
  }

  #[inline]
  pub const fn is_site_specific(&self) -> bool {
    self.site_specific
  }

  pub fn shape(&self) -> ModelShape {
    ModelShape {
      fixed_states: (!self.site_specific).then(|| self.n_states()),
    }
  }

  /// Transition probability matrix `P(t) = v exp(eigvals t) v_inv` of the
  /// first mixture component. Used by the joint ancestral reconstruction,
  /// which ignores rate categories.
  pub fn transition_matrix(&self, t: f64) -> Array2<f64> {
    let n = self.n_states();
    let exp_eig = self.eigvals[0].mapv(|x| (x * t).exp());
    let mut scaled = self.evecs[0].clone();
    for x in 0..n {
      for i in 0..n {
        scaled[[x, i]] *= exp_eig[i];
      }
    }
    scaled.dot(&self.inv_evecs[0])
  }
}
