//! Width-specialized bindings of the compute primitives. Each module
//! instantiates the shared scalar bodies under a `target_feature` attribute,
//! letting the compiler emit SSE2/AVX/AVX-512 code for the same algorithm;
//! the FMA variants additionally use fused multiply-adds.
//!
//! Soundness: these tables must only be bound through [`crate::kernel::select`]
//! after the corresponding feature flags were confirmed on the host.

use crate::kernel::generic::{
  dot3_body, dot3_body_fma, dot_body, dot_body_fma, hadamard_body, matvec_body, matvec_body_fma,
};
use crate::kernel::parsimony::fitch_body;
use crate::kernel::{CpuCapability, KernelTable};

macro_rules! width_kernels {
  ($module:ident, $feature:literal, $capability:expr, $dot:ident, $matvec:ident, $dot3:ident) => {
    pub mod $module {
      use super::*;

      #[target_feature(enable = $feature)]
      unsafe fn dot_ft(a: &[f64], b: &[f64]) -> f64 {
        $dot(a, b)
      }

      #[target_feature(enable = $feature)]
      unsafe fn matvec_ft(mat: &[f64], v: &[f64], out: &mut [f64]) {
        $matvec(mat, v, out);
      }

      #[target_feature(enable = $feature)]
      unsafe fn dot3_ft(a: &[f64], b: &[f64], c: &[f64], t: &[f64]) -> (f64, f64, f64) {
        $dot3(a, b, c, t)
      }

      #[target_feature(enable = $feature)]
      unsafe fn hadamard_ft(acc: &mut [f64], x: &[f64]) {
        hadamard_body(acc, x);
      }

      #[target_feature(enable = $feature)]
      unsafe fn fitch_ft(acc: &mut [u32], x: &[u32]) -> u32 {
        fitch_body(acc, x)
      }

      pub fn dot(a: &[f64], b: &[f64]) -> f64 {
        unsafe { dot_ft(a, b) }
      }

      pub fn matvec(mat: &[f64], v: &[f64], out: &mut [f64]) {
        unsafe { matvec_ft(mat, v, out) }
      }

      pub fn dot3(a: &[f64], b: &[f64], c: &[f64], t: &[f64]) -> (f64, f64, f64) {
        unsafe { dot3_ft(a, b, c, t) }
      }

      pub fn hadamard(acc: &mut [f64], x: &[f64]) {
        unsafe { hadamard_ft(acc, x) }
      }

      pub fn fitch(acc: &mut [u32], x: &[u32]) -> u32 {
        unsafe { fitch_ft(acc, x) }
      }

      pub const TABLE: KernelTable = KernelTable {
        capability: $capability,
        matvec,
        dot,
        dot3,
        hadamard,
        fitch,
      };
    }
  };
}

width_kernels!(sse2, "sse2", CpuCapability::Sse2, dot_body, matvec_body, dot3_body);
width_kernels!(avx, "avx,avx2", CpuCapability::Avx, dot_body, matvec_body, dot3_body);
width_kernels!(
  avx_fma,
  "avx,avx2,fma",
  CpuCapability::AvxFma,
  dot_body_fma,
  matvec_body_fma,
  dot3_body_fma
);
width_kernels!(
  avx512,
  "avx512f,fma",
  CpuCapability::Avx512,
  dot_body_fma,
  matvec_body_fma,
  dot3_body_fma
);

pub const SSE2_TABLE: KernelTable = sse2::TABLE;
pub const AVX_TABLE: KernelTable = avx::TABLE;
pub const AVX_FMA_TABLE: KernelTable = avx_fma::TABLE;
pub const AVX512_TABLE: KernelTable = avx512::TABLE;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kernel::generic;
  use approx::assert_relative_eq;

  fn inputs(n: usize) -> (Vec<f64>, Vec<f64>) {
    // Deterministic quasi-random values spanning a few orders of magnitude
    let a = (0..n).map(|i| ((i * 37 + 11) % 101) as f64 * 1e-2 + 1e-4).collect();
    let b = (0..n).map(|i| ((i * 53 + 29) % 97) as f64 * 1e-3 + 1e-5).collect();
    (a, b)
  }

  fn check_table(table: &KernelTable) {
    let (a, b) = inputs(64);
    assert_relative_eq!((table.dot)(&a, &b), (generic::TABLE.dot)(&a, &b), max_relative = 1e-12);

    let mat: Vec<f64> = inputs(8 * 8).0;
    let v = &a[..8];
    let mut out = vec![0.0; 8];
    let mut expected = vec![0.0; 8];
    (table.matvec)(&mat, v, &mut out);
    (generic::TABLE.matvec)(&mat, v, &mut expected);
    for (x, y) in out.iter().zip(&expected) {
      assert_relative_eq!(x, y, max_relative = 1e-12);
    }

    let (c, t) = inputs(64);
    let (sa, sb, sc) = (table.dot3)(&a, &b, &c, &t);
    let (ea, eb, ec) = (generic::TABLE.dot3)(&a, &b, &c, &t);
    assert_relative_eq!(sa, ea, max_relative = 1e-12);
    assert_relative_eq!(sb, eb, max_relative = 1e-12);
    assert_relative_eq!(sc, ec, max_relative = 1e-12);

    let mut acc = vec![0b0101_u32; 16];
    let other = vec![0b1010_u32; 16];
    let mut acc2 = acc.clone();
    assert_eq!((table.fitch)(&mut acc, &other), (generic::TABLE.fitch)(&mut acc2, &other));
    assert_eq!(acc, acc2);
  }

  #[test]
  fn test_sse2_agrees_with_generic() {
    if is_x86_feature_detected!("sse2") {
      check_table(&SSE2_TABLE);
    }
  }

  #[test]
  fn test_avx_agrees_with_generic() {
    if is_x86_feature_detected!("avx2") {
      check_table(&AVX_TABLE);
    }
  }

  #[test]
  fn test_avx_fma_agrees_with_generic() {
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
      check_table(&AVX_FMA_TABLE);
    }
  }

  #[test]
  fn test_avx512_agrees_with_generic() {
    if is_x86_feature_detected!("avx512f") && is_x86_feature_detected!("fma") {
      check_table(&AVX512_TABLE);
    }
  }
}
