use crate::constants::{SCALING_THRESHOLD, SCALING_THRESHOLD_INVER};
use crate::likelihood::{BufferPolicy, TreeLikelihood};
use crate::make_internal_error;
use crate::tree::tree::{BranchId, NodeId, ViewBuffer};
use eyre::Report;
use log::{trace, warn};
use parking_lot::RwLockReadGuard;
use rayon::prelude::*;

/// Inputs of one child subtree during the pruning step. Leaf children are
/// looked up in the per-code table; internal children combine their cached
/// eigenbasis buffer with the transition operator of their branch.
enum ChildData<'a> {
  Leaf {
    taxon: usize,
    vleaf: Vec<f64>,
  },
  Internal {
    partial: &'a [f64],
    scale: &'a [u8],
    echild: Vec<f64>,
  },
}

impl TreeLikelihood {
  /// Makes the view of the subtree opposite `dad` across `branch` valid,
  /// recomputing stale descendant views first (post-order, iterative).
  pub fn ensure_partial(&self, branch: BranchId, dad: NodeId) -> Result<(), Report> {
    let mut order: Vec<(BranchId, NodeId)> = Vec::new();
    let mut stack = vec![(branch, dad)];
    while let Some((b, d)) = stack.pop() {
      if self.tree.branch(b).view(d).read().computed {
        continue;
      }
      order.push((b, d));
      let node = self.tree.branch(b).other(d);
      if !self.tree.node(node).is_leaf() {
        for &next in &self.tree.node(node).branches {
          if next != b {
            stack.push((next, node));
          }
        }
      }
    }
    if !order.is_empty() {
      trace!("recomputing {} stale views toward branch {branch}", order.len());
    }
    for &(b, d) in order.iter().rev() {
      self.compute_partial(b, d)?;
    }
    Ok(())
  }

  /// Pruning step for a single view. All child views must already be valid.
  fn compute_partial(&self, branch: BranchId, dad: NodeId) -> Result<(), Report> {
    let node_id = self.tree.branch(branch).other(dad);
    let node = self.tree.node(node_id);

    // A leaf's view carries no buffer; the evaluator reads the leaf's codes
    // through the per-code table instead
    if node.is_leaf() {
      self.tree.branch(branch).view(dad).write().computed = true;
      self.tree.bump_generation();
      return Ok(());
    }

    let n = self.n_states();
    let ncat_mix = self.ncat_mix();
    let block = self.block();
    let n_ptn = self.patterns.len();

    let child_branches: Vec<BranchId> = node.branches.iter().copied().filter(|&b| b != branch).collect();
    if child_branches.len() < 2 {
      return make_internal_error!("Internal node {node_id} has fewer than 2 children during pruning");
    }

    let guards: Vec<Option<RwLockReadGuard<ViewBuffer>>> = child_branches
      .iter()
      .map(|&b| {
        let child = self.tree.branch(b).other(node_id);
        (!self.tree.node(child).is_leaf()).then(|| self.tree.branch(b).view(node_id).read())
      })
      .collect();

    let children: Vec<ChildData> = child_branches
      .iter()
      .zip(&guards)
      .map(|(&b, guard)| {
        let child = self.tree.branch(b).other(node_id);
        let echild = self.build_echild(self.tree.branch(b).length());
        match guard {
          None => {
            let taxon = self.tree.node(child).taxon.unwrap_or_default();
            Ok(ChildData::Leaf {
              taxon,
              vleaf: self.build_leaf_table(&echild),
            })
          }
          Some(view) => {
            if !view.computed {
              return make_internal_error!("Child view across branch {b} is stale during pruning");
            }
            let partial = view
              .partial
              .as_deref()
              .ok_or_else(|| crate::make_internal_report!("Child view across branch {b} has no buffer"))?;
            Ok(ChildData::Internal {
              partial,
              scale: &view.scale,
              echild,
            })
          }
        }
      })
      .collect::<Result<_, Report>>()?;

    let has_internal_child = children.iter().any(|c| matches!(c, ChildData::Internal { .. }));

    let inv_flat: Vec<Vec<f64>> = (0..self.model.n_mixtures())
      .map(|m| {
        let inv_evec = self.model.inv_evec(m);
        (0..n).flat_map(|i| (0..n).map(move |x| inv_evec[[i, x]])).collect()
      })
      .collect();

    let mut target = self.tree.branch(branch).view(dad).write();
    if target.partial.is_none() && self.options.buffer_policy == BufferPolicy::PerNode {
      if let Some((partial, scale)) = self.tree.steal_buffer(node_id, branch) {
        target.partial = Some(partial);
        target.scale = scale;
      }
    }
    let ViewBuffer { partial, scale, .. } = &mut *target;
    let out = partial.get_or_insert_with(Vec::new);
    out.resize(n_ptn * block, 0.0);
    scale.resize(n_ptn * ncat_mix, 0);

    let kernels = &self.kernels;
    out
      .par_chunks_mut(block)
      .zip(scale.par_chunks_mut(ncat_mix))
      .enumerate()
      .for_each(|(ptn, (out_ptn, scale_ptn))| {
        let mut state_partial = vec![0.0; n];
        let mut tmp = vec![0.0; n];
        for cat in 0..ncat_mix {
          let m = self.mixture_of(cat);
          state_partial.fill(1.0);
          let mut scale_sum: u32 = 0;
          for child in &children {
            match child {
              ChildData::Leaf { taxon, vleaf } => {
                let code = self.patterns.pattern(ptn).state(*taxon) as usize;
                (kernels.hadamard)(&mut state_partial, &vleaf[(code * ncat_mix + cat) * n..][..n]);
              }
              ChildData::Internal { partial, scale, echild } => {
                (kernels.matvec)(
                  &echild[cat * n * n..][..n * n],
                  &partial[ptn * block + cat * n..][..n],
                  &mut tmp,
                );
                (kernels.hadamard)(&mut state_partial, &tmp);
                scale_sum += u32::from(scale[ptn * ncat_mix + cat]);
              }
            }
          }
          let out_cat = &mut out_ptn[cat * n..(cat + 1) * n];
          (kernels.matvec)(&inv_flat[m], &state_partial, out_cat);

          // Columns an invariant site could have produced are never rescaled;
          // the evaluator adds their invariant mass at scale zero
          if has_internal_child && self.ptn_invar[ptn] == 0.0 {
            let max_abs = out_cat.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
            if max_abs < SCALING_THRESHOLD && max_abs > 0.0 {
              for v in out_cat.iter_mut() {
                *v *= SCALING_THRESHOLD_INVER;
              }
              scale_sum += 1;
            }
          }
          scale_ptn[cat] = u8::try_from(scale_sum).unwrap_or_else(|_| {
            warn!("scale counter saturated at pattern {ptn}; likelihood will lose precision");
            u8::MAX
          });
        }
      });

    target.computed = true;
    drop(target);
    self.tree.bump_generation();
    Ok(())
  }
}
