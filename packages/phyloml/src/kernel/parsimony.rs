//! Fitch parsimony primitive: combine two arrays of state sets (one bitmask
//! per pattern). Where the sets intersect, keep the intersection; where they
//! are disjoint, take the union and count one state change.

#[inline(always)]
pub(crate) fn fitch_body(acc: &mut [u32], x: &[u32]) -> u32 {
  let mut changes = 0;
  for (a, &b) in acc.iter_mut().zip(x.iter()) {
    let inter = *a & b;
    if inter == 0 {
      *a |= b;
      changes += 1;
    } else {
      *a = inter;
    }
  }
  changes
}
