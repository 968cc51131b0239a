pub mod branch;
pub mod partial;
pub mod tip;

use crate::constants::MIN_BRANCH_LENGTH;
use crate::kernel::{select, CpuFeatures, KernelRequest, KernelTable};
use crate::likelihood::branch::ThetaCache;
use crate::likelihood::tip::TipTable;
use crate::make_error;
use crate::model::rates::RateModel;
use crate::model::substitution::SubstitutionModel;
use crate::pattern::pattern::PatternStore;
use crate::tree::tree::{BranchId, Tree};
use eyre::Report;
use log::debug;
use parking_lot::RwLock;
use smart_default::SmartDefault;

/// How per-branch conditional likelihood buffers are kept
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferPolicy {
  /// Every directional view keeps its buffer once computed
  Full,
  /// At most one materialized view per branch; reorienting a traversal
  /// steals and overwrites a neighbor's buffer instead of allocating
  PerNode,
}

#[derive(Clone, Copy, Debug, SmartDefault)]
pub struct EngineOptions {
  /// Host feature flags for kernel selection; `None` probes the host
  pub features: Option<CpuFeatures>,
  #[default(BufferPolicy::Full)]
  pub buffer_policy: BufferPolicy,
}

/// Likelihood engine binding a tree, an alignment's patterns, a substitution
/// model and a rate model together with the kernel table and the precomputed
/// per-pattern quantities the evaluators need.
///
/// Conditional likelihoods are stored in the model's eigenbasis, so combining
/// two subtree views across a branch is a weighted dot product rather than a
/// matrix product.
#[derive(Debug)]
pub struct TreeLikelihood {
  pub(crate) tree: Tree,
  pub(crate) patterns: PatternStore,
  pub(crate) model: SubstitutionModel,
  pub(crate) rates: RateModel,
  pub(crate) options: EngineOptions,
  pub(crate) kernels: KernelTable,
  pub(crate) tip: TipTable,
  /// Site count behind each pattern (zero for the synthetic unobserved ones)
  pub(crate) ptn_freq: Vec<f64>,
  /// Invariant-site likelihood mass per pattern:
  /// `p_invar * sum(pi[s] for s in intersection)`, zero for columns no
  /// invariant site could have produced
  pub(crate) ptn_invar: Vec<f64>,
  pub(crate) theta: RwLock<ThetaCache>,
}

impl TreeLikelihood {
  pub fn new(
    tree: Tree,
    patterns: PatternStore,
    model: SubstitutionModel,
    rates: RateModel,
    options: EngineOptions,
  ) -> Result<Self, Report> {
    tree.validate(patterns.n_taxa())?;
    if tree.n_leaves() < 3 {
      return make_error!("Likelihood evaluation needs at least 3 taxa, got {}", tree.n_leaves());
    }
    if model.n_states() != patterns.alphabet().n_states() {
      return make_error!(
        "Model has {} states but the alignment's alphabet has {}",
        model.n_states(),
        patterns.alphabet().n_states()
      );
    }
    let features = options.features.unwrap_or_else(CpuFeatures::detect);
    let kernels = select(&features, KernelRequest::Likelihood, model.shape());
    debug!("likelihood kernels bound at capability {:?}", kernels.capability);
    let tip = TipTable::new(&model);
    let ptn_freq = patterns.patterns().iter().map(|ptn| ptn.frequency()).collect();
    let ptn_invar = compute_ptn_invar(&patterns, &model, &rates);
    Ok(Self {
      tree,
      patterns,
      model,
      rates,
      options,
      kernels,
      tip,
      ptn_freq,
      ptn_invar,
      theta: RwLock::new(ThetaCache::default()),
    })
  }

  #[inline]
  pub const fn tree(&self) -> &Tree {
    &self.tree
  }

  #[inline]
  pub const fn patterns(&self) -> &PatternStore {
    &self.patterns
  }

  #[inline]
  pub const fn model(&self) -> &SubstitutionModel {
    &self.model
  }

  #[inline]
  pub const fn rates(&self) -> &RateModel {
    &self.rates
  }

  #[inline]
  pub const fn kernels(&self) -> &KernelTable {
    &self.kernels
  }

  pub fn set_branch_length(&mut self, branch: BranchId, length: f64) -> Result<(), Report> {
    self.tree.set_branch_length(branch, length)
  }

  /// Swaps in a new model sharing the old one's alphabet. Rebinds kernels,
  /// rebuilds the tip table and drops every cached buffer.
  pub fn on_model_changed(&mut self, model: SubstitutionModel) -> Result<(), Report> {
    if model.n_states() != self.patterns.alphabet().n_states() {
      return make_error!(
        "Replacement model has {} states but the alignment's alphabet has {}",
        model.n_states(),
        self.patterns.alphabet().n_states()
      );
    }
    let features = self.options.features.unwrap_or_else(CpuFeatures::detect);
    self.kernels = select(&features, KernelRequest::Likelihood, model.shape());
    self.tip = TipTable::new(&model);
    self.ptn_invar = compute_ptn_invar(&self.patterns, &model, &self.rates);
    self.model = model;
    self.tree.clear_all_partials();
    Ok(())
  }

  #[inline]
  pub(crate) fn n_states(&self) -> usize {
    self.model.n_states()
  }

  /// Rate categories times mixture components; every buffer carries one
  /// state-vector slot per pattern for each of these
  #[inline]
  pub(crate) fn ncat_mix(&self) -> usize {
    self.rates.n_categories() * self.model.n_mixtures()
  }

  /// Values per pattern in a partial-likelihood buffer
  #[inline]
  pub(crate) fn block(&self) -> usize {
    self.ncat_mix() * self.n_states()
  }

  /// Mixture component of the flat category index
  #[inline]
  pub(crate) fn mixture_of(&self, cat: usize) -> usize {
    cat / self.rates.n_categories()
  }

  /// Rate category of the flat category index
  #[inline]
  pub(crate) fn rate_of(&self, cat: usize) -> f64 {
    self.rates.rate(cat % self.rates.n_categories())
  }

  /// Transition operator halves for one branch, per flat category:
  /// `echild[(cat * S + x) * S + i] = evec_m[x, i] * exp(eigval_m[i] * rate * length)`.
  /// Applying it to an eigenbasis vector yields the state-basis product
  /// `P(rate * length) * w`, one matvec per category.
  pub(crate) fn build_echild(&self, length: f64) -> Vec<f64> {
    let n = self.n_states();
    let length = length.max(MIN_BRANCH_LENGTH);
    let mut echild = vec![0.0; self.ncat_mix() * n * n];
    for cat in 0..self.ncat_mix() {
      let m = self.mixture_of(cat);
      let rate = self.rate_of(cat);
      let evec = self.model.evec(m);
      let eigvals = self.model.eigvals(m);
      for x in 0..n {
        let row = (cat * n + x) * n;
        for i in 0..n {
          echild[row + i] = evec[[x, i]] * (eigvals[i] * rate * length).exp();
        }
      }
    }
    echild
  }

  /// Per-code leaf vectors under one branch's transition operator:
  /// `vleaf[(code * ncat_mix + cat) * S + x]` is the `x`-th entry of
  /// `P(rate * length)` applied to the code's indicator vector. The unknown
  /// code contributes no information and is pinned to exactly all ones.
  pub(crate) fn build_leaf_table(&self, echild: &[f64]) -> Vec<f64> {
    let n = self.n_states();
    let ncat_mix = self.ncat_mix();
    let alphabet = self.patterns.alphabet();
    let n_codes = alphabet.n_codes();
    let mut vleaf = vec![0.0; n_codes * ncat_mix * n];
    for code in 0..n_codes {
      for cat in 0..ncat_mix {
        let m = self.mixture_of(cat);
        let out = &mut vleaf[(code * ncat_mix + cat) * n..(code * ncat_mix + cat + 1) * n];
        if code as u32 == alphabet.unknown() {
          out.fill(1.0);
        } else {
          let tipvec = self.tip.vector(code as u32, m);
          (self.kernels.matvec)(&echild[cat * n * n..(cat + 1) * n * n], tipvec, out);
        }
      }
    }
    vleaf
  }
}

fn compute_ptn_invar(patterns: &PatternStore, model: &SubstitutionModel, rates: &RateModel) -> Vec<f64> {
  let p_invar = rates.p_invar();
  let pi = model.pi();
  patterns
    .patterns()
    .iter()
    .map(|ptn| {
      if p_invar == 0.0 || !ptn.is_invariant_capable() {
        0.0
      } else {
        let mask = ptn.intersection();
        let pi_mass: f64 = (0..model.n_states())
          .filter(|&s| mask & (1 << s) != 0)
          .map(|s| pi[s])
          .sum();
        p_invar * pi_mass
      }
    })
    .collect()
}
