use ndarray::{Array, Array1, Array2, Dimension};

/// Element-wise natural logarithm
pub fn log<D: Dimension>(x: &Array<f64, D>) -> Array<f64, D> {
  x.mapv(f64::ln)
}

/// Index of the largest element of each row
pub fn argmax_axis1(arr: &Array2<f64>) -> Array1<usize> {
  let argmax = arr
    .rows()
    .into_iter()
    .map(|row| {
      row
        .iter()
        .enumerate()
        .fold((0_usize, f64::NEG_INFINITY), |(i_max, x_max), (i, &x)| {
          if x > x_max {
            (i, x)
          } else {
            (i_max, x_max)
          }
        })
        .0
    })
    .collect::<Vec<usize>>();
  Array1::from_vec(argmax)
}

/// Divides each row by its sum
pub fn normalize_rows(arr: &mut Array2<f64>) {
  for mut row in arr.rows_mut() {
    let norm = row.sum();
    if norm > 0.0 {
      row.mapv_inplace(|x| x / norm);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use ndarray::array;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_argmax_axis1() {
    let a = array![[0.1, 0.7, 0.2], [0.9, 0.05, 0.05]];
    assert_eq!(argmax_axis1(&a).to_vec(), vec![1, 0]);
  }

  #[test]
  fn test_normalize_rows() {
    let mut a = array![[1.0, 3.0], [2.0, 2.0]];
    normalize_rows(&mut a);
    assert_ulps_eq!(a[[0, 0]], 0.25);
    assert_ulps_eq!(a[[1, 1]], 0.5);
  }
}
