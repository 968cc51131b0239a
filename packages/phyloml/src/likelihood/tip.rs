use crate::model::substitution::SubstitutionModel;

/// Precomputed per-code tip vectors in the eigenbasis.
///
/// A leaf observed in code `c` contributes the indicator vector of the
/// resolved state set, transformed by `inv_evec`. The table holds that
/// transform for every code of the alphabet and every mixture component, so
/// the inner loops only index, never resolve ambiguity sets.
#[derive(Clone, Debug)]
pub struct TipTable {
  n_states: usize,
  n_mixtures: usize,
  /// `values[code * n_mixtures * n_states + m * n_states + i]`
  values: Vec<f64>,
}

impl TipTable {
  pub fn new(model: &SubstitutionModel) -> Self {
    let alphabet = model.alphabet();
    let n_states = model.n_states();
    let n_mixtures = model.n_mixtures();
    let n_codes = alphabet.n_codes();
    let mut values = vec![0.0; n_codes * n_mixtures * n_states];
    for code in 0..n_codes {
      for m in 0..n_mixtures {
        let inv_evec = model.inv_evec(m);
        let offset = (code * n_mixtures + m) * n_states;
        for x in alphabet.resolve(code as u32) {
          for i in 0..n_states {
            values[offset + i] += inv_evec[[i, x]];
          }
        }
      }
    }
    Self {
      n_states,
      n_mixtures,
      values,
    }
  }

  /// Eigenbasis tip vector of `code` under mixture component `m`
  #[inline]
  pub fn vector(&self, code: u32, m: usize) -> &[f64] {
    let offset = (code as usize * self.n_mixtures + m) * self.n_states;
    &self.values[offset..offset + self.n_states]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;

  #[test]
  fn test_canonical_code_is_an_inv_evec_column() {
    let model = SubstitutionModel::jc69();
    let table = TipTable::new(&model);
    let inv_evec = model.inv_evec(0);
    for x in 0..4 {
      let v = table.vector(x as u32, 0);
      for i in 0..4 {
        assert_ulps_eq!(v[i], inv_evec[[i, x]]);
      }
    }
  }

  #[test]
  fn test_ambiguity_code_sums_member_columns() {
    let model = SubstitutionModel::jc69();
    let alphabet = model.alphabet().clone();
    let table = TipTable::new(&model);
    // 'R' resolves to {A, G}
    let code = alphabet.code_of_char('R').unwrap();
    let inv_evec = model.inv_evec(0);
    let v = table.vector(code, 0);
    for i in 0..4 {
      assert_ulps_eq!(v[i], inv_evec[[i, 0]] + inv_evec[[i, 2]]);
    }
  }

  #[test]
  fn test_unknown_code_sums_all_columns() {
    let model = SubstitutionModel::jc69();
    let alphabet = model.alphabet().clone();
    let table = TipTable::new(&model);
    let inv_evec = model.inv_evec(0);
    let v = table.vector(alphabet.unknown(), 0);
    for i in 0..4 {
      let row_sum: f64 = (0..4).map(|x| inv_evec[[i, x]]).sum();
      assert_ulps_eq!(v[i], row_sum);
    }
  }
}
