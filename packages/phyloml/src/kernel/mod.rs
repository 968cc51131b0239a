pub mod generic;
pub mod parsimony;
#[cfg(target_arch = "x86_64")]
pub mod vector;

/// `out[x] = sum_i mat[x * v.len() + i] * v[i]` for `out.len()` rows
pub type MatVecFn = fn(mat: &[f64], v: &[f64], out: &mut [f64]);
/// `sum_i a[i] * b[i]`
pub type DotFn = fn(a: &[f64], b: &[f64]) -> f64;
/// `(sum_i a[i]*t[i], sum_i b[i]*t[i], sum_i c[i]*t[i])` in one pass
pub type Dot3Fn = fn(a: &[f64], b: &[f64], c: &[f64], t: &[f64]) -> (f64, f64, f64);
/// `acc[i] *= x[i]`
pub type HadamardFn = fn(acc: &mut [f64], x: &[f64]);
/// Fitch combination: per slot intersection, union where the intersection is
/// empty; returns the number of union events (parsimony score increments)
pub type FitchFn = fn(acc: &mut [u32], x: &[u32]) -> u32;

/// Host vector capability, widest first when comparing
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuCapability {
  Scalar,
  Sse2,
  Avx,
  AvxFma,
  Avx512,
}

/// Raw feature flags as reported by the host (or injected by the caller;
/// feature probing itself is not this crate's business)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuFeatures {
  pub sse2: bool,
  pub avx: bool,
  pub fma: bool,
  pub avx512f: bool,
}

impl CpuFeatures {
  #[cfg(target_arch = "x86_64")]
  pub fn detect() -> Self {
    Self {
      sse2: is_x86_feature_detected!("sse2"),
      avx: is_x86_feature_detected!("avx") && is_x86_feature_detected!("avx2"),
      fma: is_x86_feature_detected!("fma"),
      avx512f: is_x86_feature_detected!("avx512f"),
    }
  }

  #[cfg(not(target_arch = "x86_64"))]
  pub fn detect() -> Self {
    Self::default()
  }
}

/// What the selector needs to know about the model: a fixed state count can
/// be driven through width-specialized kernels, a per-site heterogeneous
/// model cannot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelShape {
  pub fixed_states: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelRequest {
  Likelihood,
  Parsimony,
}

/// Consistent set of compute primitives bound once per tree instance
#[derive(Clone, Copy, Debug)]
pub struct KernelTable {
  pub capability: CpuCapability,
  pub matvec: MatVecFn,
  pub dot: DotFn,
  pub dot3: Dot3Fn,
  pub hadamard: HadamardFn,
  pub fitch: FitchFn,
}

/// Widest width the flags support; a request that needs a missing capability
/// degrades to the next-widest consistent set
pub fn choose_capability(features: &CpuFeatures) -> CpuCapability {
  if !cfg!(target_arch = "x86_64") {
    return CpuCapability::Scalar;
  }
  if features.avx512f && features.fma {
    CpuCapability::Avx512
  } else if features.avx && features.fma {
    CpuCapability::AvxFma
  } else if features.avx {
    CpuCapability::Avx
  } else if features.sse2 {
    CpuCapability::Sse2
  } else {
    CpuCapability::Scalar
  }
}

/// Binds the function table for the given host flags, request and model
/// shape. Idempotent; call again if the model shape changes.
pub fn select(features: &CpuFeatures, request: KernelRequest, shape: ModelShape) -> KernelTable {
  let capability = match (request, shape.fixed_states) {
    // A model without a fixed state count cannot be compiled into a single
    // fixed vector width
    (KernelRequest::Likelihood, None) => CpuCapability::Scalar,
    _ => choose_capability(features),
  };
  bind(capability)
}

fn bind(capability: CpuCapability) -> KernelTable {
  #[cfg(target_arch = "x86_64")]
  {
    match capability {
      CpuCapability::Scalar => generic::TABLE,
      CpuCapability::Sse2 => vector::SSE2_TABLE,
      CpuCapability::Avx => vector::AVX_TABLE,
      CpuCapability::AvxFma => vector::AVX_FMA_TABLE,
      CpuCapability::Avx512 => vector::AVX512_TABLE,
    }
  }
  #[cfg(not(target_arch = "x86_64"))]
  {
    let _ = capability;
    generic::TABLE
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  const fn features(sse2: bool, avx: bool, fma: bool, avx512f: bool) -> CpuFeatures {
    CpuFeatures { sse2, avx, fma, avx512f }
  }

  #[cfg(target_arch = "x86_64")]
  mod x86 {
    use super::{choose_capability, features, CpuCapability, CpuFeatures};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(features(false, false, false, false), CpuCapability::Scalar)]
    #[case(features(true, false, false, false), CpuCapability::Sse2)]
    #[case(features(true, true, false, false), CpuCapability::Avx)]
    #[case(features(true, true, true, false), CpuCapability::AvxFma)]
    #[case(features(true, true, true, true), CpuCapability::Avx512)]
    // AVX-512 without FMA degrades past the FMA tables down to plain AVX
    #[case(features(true, true, false, true), CpuCapability::Avx)]
    fn test_capability_policy(#[case] features: CpuFeatures, #[case] expected: CpuCapability) {
      assert_eq!(choose_capability(&features), expected);
    }
  }

  #[test]
  fn test_site_specific_models_get_the_scalar_table() {
    let features = features(true, true, true, true);
    let table = select(&features, KernelRequest::Likelihood, ModelShape { fixed_states: None });
    assert_eq!(table.capability, CpuCapability::Scalar);
  }

  #[test]
  fn test_parsimony_requests_ignore_the_model_shape() {
    let features = CpuFeatures::detect();
    let table = select(&features, KernelRequest::Parsimony, ModelShape { fixed_states: None });
    assert_eq!(table.capability, choose_capability(&features));
  }

  #[test]
  fn test_fixed_state_models_get_the_widest_table() {
    let features = CpuFeatures::detect();
    let table = select(&features, KernelRequest::Likelihood, ModelShape { fixed_states: Some(4) });
    assert_eq!(table.capability, choose_capability(&features));
  }

  #[test]
  fn test_selection_is_idempotent() {
    let features = CpuFeatures::detect();
    let shape = ModelShape { fixed_states: Some(4) };
    let a = select(&features, KernelRequest::Likelihood, shape);
    let b = select(&features, KernelRequest::Likelihood, shape);
    assert_eq!(a.capability, b.capability);
  }
}
