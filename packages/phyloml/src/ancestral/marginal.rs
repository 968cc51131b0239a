use crate::constants::SCALING_THRESHOLD;
use crate::likelihood::TreeLikelihood;
use crate::make_error;
use crate::tree::tree::NodeId;
use crate::utils::ndarray::{argmax_axis1, normalize_rows};
use eyre::Report;
use ndarray::{Array1, Array2};
use rayon::prelude::*;

impl TreeLikelihood {
  /// Posterior state distribution of one internal node, per pattern: the
  /// subtree below the node and the rest of the tree seen across its first
  /// branch, combined per category and normalized to 1 per pattern.
  pub fn ancestral_marginal(&self, node: NodeId) -> Result<Array2<f64>, Report> {
    if self.tree.node(node).is_leaf() {
      return make_error!("Marginal ancestral reconstruction needs an internal node, node {node} is a leaf");
    }
    let branch = self.tree.node(node).branches[0];
    let dad = self.tree.branch(branch).other(node);
    self.ensure_partial(branch, dad)?;
    self.ensure_partial(branch, node)?;

    let n = self.n_states();
    let ncat_mix = self.ncat_mix();
    let block = self.block();
    let n_ptn = self.patterns.len();
    let n_categories = self.rates.n_categories();
    let echild = self.build_echild(self.tree.branch(branch).length());

    let node_view = self.tree.branch(branch).view(dad).read();
    let partial_node = node_view
      .partial
      .as_deref()
      .ok_or_else(|| crate::make_internal_report!("View across branch {branch} has no buffer"))?;
    let scale_node = &node_view.scale;

    let dad_is_leaf = self.tree.node(dad).is_leaf();
    let dad_view = (!dad_is_leaf).then(|| self.tree.branch(branch).view(node).read());
    let dad_taxon = self.tree.node(dad).taxon.unwrap_or_default();
    let (partial_dad, scale_dad) = match &dad_view {
      Some(view) => (
        Some(
          view
            .partial
            .as_deref()
            .ok_or_else(|| crate::make_internal_report!("Opposite view across branch {branch} has no buffer"))?,
        ),
        Some(view.scale.as_slice()),
      ),
      None => (None, None),
    };

    // inv_evec by columns: applying it to an eigenbasis vector recovers the
    // stationary-weighted state-basis values
    let inv_t: Vec<Vec<f64>> = (0..self.model.n_mixtures())
      .map(|m| {
        let inv_evec = self.model.inv_evec(m);
        (0..n).flat_map(|x| (0..n).map(move |i| inv_evec[[i, x]])).collect()
      })
      .collect();

    let p_invar = self.rates.p_invar();
    let kernels = &self.kernels;
    let mut flat = vec![0.0; n_ptn * n];
    flat.par_chunks_mut(n).enumerate().for_each(|(ptn, post)| {
      let mut scales = vec![0_u32; ncat_mix];
      for cat in 0..ncat_mix {
        let mut s = u32::from(scale_node[ptn * ncat_mix + cat]);
        if let Some(scale_dad) = scale_dad {
          s += u32::from(scale_dad[ptn * ncat_mix + cat]);
        }
        scales[cat] = s;
      }
      let min_scale = scales.iter().copied().min().unwrap_or(0);

      let mut vnode = vec![0.0; n];
      let mut vdad = vec![0.0; n];
      for cat in 0..ncat_mix {
        if scales[cat] > min_scale + 1 {
          continue;
        }
        let factor = if scales[cat] == min_scale { 1.0 } else { SCALING_THRESHOLD };
        let m = self.mixture_of(cat);
        let prop = self.rates.proportion(cat % n_categories) * self.model.mixture_weight(m);
        let w = &partial_node[ptn * block + cat * n..][..n];
        (kernels.matvec)(&inv_t[m], w, &mut vnode);
        match partial_dad {
          Some(partial_dad) => {
            let u = &partial_dad[ptn * block + cat * n..][..n];
            (kernels.matvec)(&echild[cat * n * n..][..n * n], u, &mut vdad);
          }
          None => {
            let code = self.patterns.pattern(ptn).state(dad_taxon);
            (kernels.matvec)(&echild[cat * n * n..][..n * n], self.tip.vector(code, m), &mut vdad);
          }
        }
        for x in 0..n {
          post[x] += prop * factor * vnode[x] * vdad[x];
        }
      }

      // An invariant site pins the whole tree, including this node, to one
      // of the states in the column's intersection
      if min_scale == 0 && p_invar > 0.0 {
        let mask = self.patterns.pattern(ptn).intersection();
        for x in 0..n {
          if mask >> x & 1 == 1 {
            post[x] += p_invar * self.model.pi()[x];
          }
        }
      }
    });

    let mut posterior = Array2::from_shape_vec((n_ptn, n), flat)?;
    normalize_rows(&mut posterior);
    Ok(posterior)
  }

  /// Most probable state of one internal node per pattern, under the
  /// marginal posterior
  pub fn ancestral_marginal_states(&self, node: NodeId) -> Result<Array1<usize>, Report> {
    Ok(argmax_axis1(&self.ancestral_marginal(node)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::Alphabet;
  use crate::likelihood::EngineOptions;
  use crate::model::rates::RateModel;
  use crate::model::substitution::SubstitutionModel;
  use crate::pattern::pattern::PatternStore;
  use crate::tree::tree::Tree;
  use approx::{assert_relative_eq, assert_ulps_eq};
  use eyre::Report;

  fn star3_engine(seqs: &[&str]) -> (TreeLikelihood, NodeId) {
    let mut tree = Tree::new();
    let center = tree.add_internal();
    for (taxon, &length) in [0.1, 0.2, 0.3].iter().enumerate() {
      let leaf = tree.add_leaf(format!("t{taxon}"), taxon);
      tree.connect(center, leaf, length).unwrap();
    }
    let patterns = PatternStore::from_sequences(Alphabet::binary(), seqs).unwrap();
    let engine = TreeLikelihood::new(
      tree,
      patterns,
      SubstitutionModel::symmetric_binary(),
      RateModel::uniform(),
      EngineOptions::default(),
    )
    .unwrap();
    (engine, center)
  }

  #[test]
  fn test_star_posterior_matches_bayes_rule() -> Result<(), Report> {
    let (engine, center) = star3_engine(&["0", "1", "0"]);
    let posterior = engine.ancestral_marginal(center)?;
    let model = engine.model();
    let p: Vec<_> = [0.1, 0.2, 0.3].iter().map(|&t| model.transition_matrix(t)).collect();
    let codes = [0, 1, 0];
    let joint: Vec<f64> = (0..2)
      .map(|x| model.pi()[x] * (0..3).map(|leaf| p[leaf][[x, codes[leaf]]]).product::<f64>())
      .collect();
    let total: f64 = joint.iter().sum();
    for x in 0..2 {
      assert_relative_eq!(posterior[[0, x]], joint[x] / total, max_relative = 1e-12);
    }
    Ok(())
  }

  #[test]
  fn test_posterior_rows_sum_to_one() -> Result<(), Report> {
    let patterns = PatternStore::from_sequences(Alphabet::dna(), &["ACGTA", "ACGCA", "ATGTC", "GCGTA"])?;
    let engine = TreeLikelihood::new(
      Tree::caterpillar(4, 0.2)?,
      patterns,
      SubstitutionModel::jc69(),
      RateModel::new(vec![0.5, 1.5], vec![0.5, 0.5], 0.0)?,
      EngineOptions::default(),
    )?;
    for node in engine.tree().nodes() {
      if node.is_leaf() {
        continue;
      }
      let posterior = engine.ancestral_marginal(node.id)?;
      for ptn in 0..engine.patterns().len() {
        let row_sum: f64 = (0..4).map(|x| posterior[[ptn, x]]).sum();
        assert_ulps_eq!(row_sum, 1.0, max_ulps = 8);
      }
    }
    Ok(())
  }

  #[test]
  fn test_marginal_states_pick_the_posterior_mode() -> Result<(), Report> {
    let (engine, center) = star3_engine(&["0", "0", "1"]);
    let posterior = engine.ancestral_marginal(center)?;
    let states = engine.ancestral_marginal_states(center)?;
    let expected = if posterior[[0, 0]] > posterior[[0, 1]] { 0 } else { 1 };
    assert_eq!(states[0], expected);
    Ok(())
  }

  #[test]
  fn test_rejects_leaf_nodes() {
    let (engine, _) = star3_engine(&["0", "1", "0"]);
    let leaf = engine.tree().leaves().next().unwrap().id;
    assert!(engine.ancestral_marginal(leaf).is_err());
  }
}
