//! Scalar reference implementations of the compute primitives. The bodies
//! are `#[inline(always)]` so the width-specialized wrappers in `vector`
//! instantiate them under their own target features.

use crate::kernel::parsimony::fitch_body;
use crate::kernel::{CpuCapability, KernelTable};

#[inline(always)]
pub(crate) fn dot_body(a: &[f64], b: &[f64]) -> f64 {
  let n = a.len().min(b.len());
  let (mut s0, mut s1, mut s2, mut s3) = (0.0, 0.0, 0.0, 0.0);
  let mut i = 0;
  while i + 4 <= n {
    s0 += a[i] * b[i];
    s1 += a[i + 1] * b[i + 1];
    s2 += a[i + 2] * b[i + 2];
    s3 += a[i + 3] * b[i + 3];
    i += 4;
  }
  while i < n {
    s0 += a[i] * b[i];
    i += 1;
  }
  (s0 + s1) + (s2 + s3)
}

#[inline(always)]
pub(crate) fn dot_body_fma(a: &[f64], b: &[f64]) -> f64 {
  let n = a.len().min(b.len());
  let (mut s0, mut s1, mut s2, mut s3) = (0.0, 0.0, 0.0, 0.0);
  let mut i = 0;
  while i + 4 <= n {
    s0 = a[i].mul_add(b[i], s0);
    s1 = a[i + 1].mul_add(b[i + 1], s1);
    s2 = a[i + 2].mul_add(b[i + 2], s2);
    s3 = a[i + 3].mul_add(b[i + 3], s3);
    i += 4;
  }
  while i < n {
    s0 = a[i].mul_add(b[i], s0);
    i += 1;
  }
  (s0 + s1) + (s2 + s3)
}

#[inline(always)]
pub(crate) fn matvec_body(mat: &[f64], v: &[f64], out: &mut [f64]) {
  let n = v.len();
  for (x, out_x) in out.iter_mut().enumerate() {
    *out_x = dot_body(&mat[x * n..(x + 1) * n], v);
  }
}

#[inline(always)]
pub(crate) fn matvec_body_fma(mat: &[f64], v: &[f64], out: &mut [f64]) {
  let n = v.len();
  for (x, out_x) in out.iter_mut().enumerate() {
    *out_x = dot_body_fma(&mat[x * n..(x + 1) * n], v);
  }
}

#[inline(always)]
pub(crate) fn dot3_body(a: &[f64], b: &[f64], c: &[f64], t: &[f64]) -> (f64, f64, f64) {
  let mut sa = 0.0;
  let mut sb = 0.0;
  let mut sc = 0.0;
  for i in 0..t.len() {
    sa += a[i] * t[i];
    sb += b[i] * t[i];
    sc += c[i] * t[i];
  }
  (sa, sb, sc)
}

#[inline(always)]
pub(crate) fn dot3_body_fma(a: &[f64], b: &[f64], c: &[f64], t: &[f64]) -> (f64, f64, f64) {
  let mut sa = 0.0;
  let mut sb = 0.0;
  let mut sc = 0.0;
  for i in 0..t.len() {
    sa = a[i].mul_add(t[i], sa);
    sb = b[i].mul_add(t[i], sb);
    sc = c[i].mul_add(t[i], sc);
  }
  (sa, sb, sc)
}

#[inline(always)]
pub(crate) fn hadamard_body(acc: &mut [f64], x: &[f64]) {
  for (a, &b) in acc.iter_mut().zip(x.iter()) {
    *a *= b;
  }
}

pub fn matvec(mat: &[f64], v: &[f64], out: &mut [f64]) {
  matvec_body(mat, v, out);
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
  dot_body(a, b)
}

pub fn dot3(a: &[f64], b: &[f64], c: &[f64], t: &[f64]) -> (f64, f64, f64) {
  dot3_body(a, b, c, t)
}

pub fn hadamard(acc: &mut [f64], x: &[f64]) {
  hadamard_body(acc, x);
}

pub fn fitch(acc: &mut [u32], x: &[u32]) -> u32 {
  fitch_body(acc, x)
}

pub const TABLE: KernelTable = KernelTable {
  capability: CpuCapability::Scalar,
  matvec,
  dot,
  dot3,
  hadamard,
  fitch,
};
