use crate::constants::MIN_BRANCH_LENGTH;
use crate::likelihood::TreeLikelihood;
use crate::make_internal_error;
use crate::tree::tree::{BranchId, NodeId};
use crate::utils::ndarray::log;
use eyre::Report;
use ndarray::Array2;

impl TreeLikelihood {
  /// Most probable joint assignment of ancestral states (Pupko-style dynamic
  /// program), one state per internal node and pattern; leaves map to `None`.
  ///
  /// The program runs in log space and needs no rescaling. Rate categories
  /// are ignored; the first mixture component's transition matrices drive
  /// the recursion.
  pub fn ancestral_joint(&self) -> Result<Vec<Option<Vec<usize>>>, Report> {
    let n = self.n_states();
    let n_ptn = self.patterns.len();
    let tree = &self.tree;
    let alphabet = self.patterns.alphabet();

    // The traversal is rooted at an arbitrary leaf; its pendant branch
    // anchors both passes
    let root = match tree.leaves().next() {
      Some(leaf) => leaf,
      None => return make_internal_error!("Tree has no leaves"),
    };
    let root_branch = root.branches[0];

    let mut order: Vec<(BranchId, NodeId)> = Vec::new();
    let mut stack = vec![(root_branch, root.id)];
    while let Some((b, d)) = stack.pop() {
      order.push((b, d));
      let node = tree.branch(b).other(d);
      if !tree.node(node).is_leaf() {
        for &next in &tree.node(node).branches {
          if next != b {
            stack.push((next, node));
          }
        }
      }
    }

    // Pass 1, post-order. For the subtree across branch `b` seen from `d`:
    // `subtree_l[b][ptn * n + x]` is the best log-probability of that subtree
    // given parent state `x`; `traceback[node][ptn * n + x]` the maximizing
    // state of `node`.
    let mut subtree_l: Vec<Option<Vec<f64>>> = (0..tree.n_branches()).map(|_| None).collect();
    let mut traceback: Vec<Option<Vec<usize>>> = (0..tree.n_nodes()).map(|_| None).collect();
    for &(b, d) in order.iter().rev() {
      let node_id = tree.branch(b).other(d);
      let t = tree.branch(b).length().max(MIN_BRANCH_LENGTH);
      let p = self.model.transition_matrix(t);
      let ln_p: Array2<f64> = log(&p);
      let mut l = vec![f64::NEG_INFINITY; n_ptn * n];

      if let Some(taxon) = tree.node(node_id).taxon {
        // An ambiguous leaf is marginalized over its resolved set, so an
        // unknown code contributes nothing
        for ptn in 0..n_ptn {
          let mask = alphabet.mask(self.patterns.pattern(ptn).state(taxon));
          for x in 0..n {
            l[ptn * n + x] = (0..n)
              .filter(|&y| mask >> y & 1 == 1)
              .map(|y| p[[x, y]])
              .sum::<f64>()
              .ln();
          }
        }
      } else {
        let mut below = vec![0.0; n_ptn * n];
        for &next in &tree.node(node_id).branches {
          if next == b {
            continue;
          }
          let child_l = match subtree_l[next].take() {
            Some(child_l) => child_l,
            None => return make_internal_error!("Missing subtree scores across branch {next}"),
          };
          for (acc, v) in below.iter_mut().zip(&child_l) {
            *acc += v;
          }
        }
        let mut c = vec![0_usize; n_ptn * n];
        for ptn in 0..n_ptn {
          for x in 0..n {
            let (best_y, best) = (0..n)
              .map(|y| (y, ln_p[[x, y]] + below[ptn * n + y]))
              .fold((0, f64::NEG_INFINITY), |acc, cand| if cand.1 > acc.1 { cand } else { acc });
            l[ptn * n + x] = best;
            c[ptn * n + x] = best_y;
          }
        }
        traceback[node_id] = Some(c);
      }
      subtree_l[b] = Some(l);
    }

    // Root step: the root leaf's state maximizes its stationary probability
    // plus the subtree score across its pendant branch
    let l_root = match subtree_l[root_branch].take() {
      Some(l_root) => l_root,
      None => return make_internal_error!("Missing subtree scores at the traversal root"),
    };
    let root_taxon = root.taxon.unwrap_or_default();
    let ln_pi = log(self.model.pi());
    let root_states: Vec<usize> = (0..n_ptn)
      .map(|ptn| {
        let mask = alphabet.mask(self.patterns.pattern(ptn).state(root_taxon));
        (0..n)
          .filter(|&s| mask >> s & 1 == 1)
          .map(|s| (s, ln_pi[s] + l_root[ptn * n + s]))
          .fold((0, f64::NEG_INFINITY), |acc, cand| if cand.1 > acc.1 { cand } else { acc })
          .0
      })
      .collect();

    // Pass 2, pre-order: read each node's traceback under its parent's
    // chosen states; leaves stay unassigned
    let mut assignments: Vec<Option<Vec<usize>>> = (0..tree.n_nodes()).map(|_| None).collect();
    let mut stack: Vec<(BranchId, NodeId, Vec<usize>)> = vec![(root_branch, root.id, root_states)];
    while let Some((b, d, parent_states)) = stack.pop() {
      let node_id = tree.branch(b).other(d);
      if tree.node(node_id).is_leaf() {
        continue;
      }
      let c = match traceback[node_id].take() {
        Some(c) => c,
        None => return make_internal_error!("Missing traceback at node {node_id}"),
      };
      let states: Vec<usize> = (0..n_ptn).map(|ptn| c[ptn * n + parent_states[ptn]]).collect();
      for &next in &tree.node(node_id).branches {
        if next != b {
          stack.push((next, node_id, states.clone()));
        }
      }
      assignments[node_id] = Some(states);
    }
    Ok(assignments)
  }
}
