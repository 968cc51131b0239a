use crate::{make_error, make_internal_error};
use eyre::Report;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub type NodeId = usize;
pub type BranchId = usize;

#[derive(Clone, Debug)]
pub struct Node {
  pub id: NodeId,
  pub name: Option<String>,
  /// Row of this taxon in the pattern store; `Some` exactly for leaves
  pub taxon: Option<usize>,
  pub branches: Vec<BranchId>,
}

impl Node {
  #[inline]
  pub const fn is_leaf(&self) -> bool {
    self.taxon.is_some()
  }

  #[inline]
  pub fn degree(&self) -> usize {
    self.branches.len()
  }
}

/// Cached conditional likelihoods of one subtree, as seen from one side of a
/// branch. `partial` holds `[pattern][category-mixture][state]` values in the
/// model's eigenbasis; `scale` counts rescaling events per
/// `[pattern][category-mixture]`. Valid only while `computed` is set.
#[derive(Debug, Default)]
pub struct ViewBuffer {
  pub partial: Option<Vec<f64>>,
  pub scale: Vec<u8>,
  pub computed: bool,
}

/// Undirected branch. `views[i]` is the view of the subtree *opposite*
/// `nodes[i]`, i.e. the buffer used when `nodes[i]` acts as "dad".
#[derive(Debug)]
pub struct Branch {
  pub id: BranchId,
  pub nodes: [NodeId; 2],
  length: f64,
  views: [RwLock<ViewBuffer>; 2],
}

impl Branch {
  #[inline]
  pub fn other(&self, node: NodeId) -> NodeId {
    if self.nodes[0] == node {
      self.nodes[1]
    } else {
      self.nodes[0]
    }
  }

  #[inline]
  pub fn has_endpoint(&self, node: NodeId) -> bool {
    self.nodes[0] == node || self.nodes[1] == node
  }

  #[inline]
  fn view_index(&self, dad: NodeId) -> usize {
    debug_assert!(self.has_endpoint(dad));
    usize::from(self.nodes[0] != dad)
  }

  /// Buffer for the subtree on the far side of the branch, relative to `dad`
  #[inline]
  pub fn view(&self, dad: NodeId) -> &RwLock<ViewBuffer> {
    &self.views[self.view_index(dad)]
  }

  #[inline]
  pub const fn length(&self) -> f64 {
    self.length
  }
}

/// Unrooted phylogenetic tree stored as flat node and branch arenas. Every
/// traversal is rooted ad hoc by naming one branch endpoint "dad".
#[derive(Debug, Default)]
pub struct Tree {
  nodes: Vec<Node>,
  branches: Vec<Branch>,
  /// Bumped whenever any cached buffer changes; lets downstream caches
  /// (e.g. the derivative theta buffer) detect staleness cheaply.
  generation: AtomicU64,
}

impl Tree {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_leaf(&mut self, name: impl Into<String>, taxon: usize) -> NodeId {
    let id = self.nodes.len();
    self.nodes.push(Node {
      id,
      name: Some(name.into()),
      taxon: Some(taxon),
      branches: vec![],
    });
    id
  }

  pub fn add_internal(&mut self) -> NodeId {
    let id = self.nodes.len();
    self.nodes.push(Node {
      id,
      name: None,
      taxon: None,
      branches: vec![],
    });
    id
  }

  pub fn connect(&mut self, a: NodeId, b: NodeId, length: f64) -> Result<BranchId, Report> {
    if a == b || a >= self.nodes.len() || b >= self.nodes.len() {
      return make_error!("Cannot connect nodes {a} and {b}");
    }
    if length < 0.0 {
      return make_error!("Branch length must be non-negative, got {length}");
    }
    if self.nodes[a].branches.iter().any(|&id| self.branches[id].has_endpoint(b)) {
      return make_error!("Nodes {a} and {b} are already connected");
    }
    let id = self.branches.len();
    self.branches.push(Branch {
      id,
      nodes: [a, b],
      length,
      views: [RwLock::default(), RwLock::default()],
    });
    self.nodes[a].branches.push(id);
    self.nodes[b].branches.push(id);
    Ok(id)
  }

  #[inline]
  pub fn node(&self, id: NodeId) -> &Node {
    &self.nodes[id]
  }

  #[inline]
  pub fn branch(&self, id: BranchId) -> &Branch {
    &self.branches[id]
  }

  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn branches(&self) -> &[Branch] {
    &self.branches
  }

  #[inline]
  pub fn n_nodes(&self) -> usize {
    self.nodes.len()
  }

  #[inline]
  pub fn n_branches(&self) -> usize {
    self.branches.len()
  }

  pub fn leaves(&self) -> impl Iterator<Item = &Node> {
    self.nodes.iter().filter(|node| node.is_leaf())
  }

  pub fn n_leaves(&self) -> usize {
    self.leaves().count()
  }

  #[inline]
  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::Acquire)
  }

  pub(crate) fn bump_generation(&self) {
    self.generation.fetch_add(1, Ordering::AcqRel);
  }

  /// Changes a branch length and drops every cached buffer that was computed
  /// through this branch. The branch's own two views stay valid: they
  /// describe subtrees that do not contain the branch.
  pub fn set_branch_length(&mut self, branch: BranchId, length: f64) -> Result<(), Report> {
    if length < 0.0 {
      return make_error!("Branch length must be non-negative, got {length}");
    }
    self.branches[branch].length = length;
    self.invalidate_dependents(branch);
    Ok(())
  }

  /// Clears one directional buffer's validity flag
  pub fn invalidate_view(&self, branch: BranchId, dad: NodeId) {
    self.branches[branch].view(dad).write().computed = false;
    self.bump_generation();
  }

  /// Clears every view whose subtree contains the given branch: walking
  /// outward from both endpoints, the view of each encountered branch that
  /// looks back toward the starting branch.
  pub fn invalidate_dependents(&self, branch: BranchId) {
    let mut stack: Vec<(NodeId, BranchId)> = self.branches[branch]
      .nodes
      .iter()
      .map(|&node| (node, branch))
      .collect();
    while let Some((node, from)) = stack.pop() {
      for &next in &self.nodes[node].branches {
        if next == from {
          continue;
        }
        let far = self.branches[next].other(node);
        // view(next, far) holds the subtree on `node`'s side, which
        // includes the invalidated branch
        self.branches[next].view(far).write().computed = false;
        stack.push((far, next));
      }
    }
    self.bump_generation();
  }

  pub fn clear_all_partials(&self) {
    for branch in &self.branches {
      for view in &branch.views {
        view.write().computed = false;
      }
    }
    self.bump_generation();
  }

  /// Takes over the buffer allocation of the opposite-direction view of a
  /// neighboring branch, invalidating it. Used by the memory-saving buffer
  /// policy under which at most one view per branch is materialized.
  pub(crate) fn steal_buffer(&self, node: NodeId, except: BranchId) -> Option<(Vec<f64>, Vec<u8>)> {
    for &id in &self.nodes[node].branches {
      if id == except {
        continue;
      }
      let child = self.branches[id].other(node);
      // view(child) of this branch holds the subtree on `node`'s side
      let mut back = self.branches[id].view(child).write();
      if let Some(partial) = back.partial.take() {
        back.computed = false;
        let scale = std::mem::take(&mut back.scale);
        return Some((partial, scale));
      }
    }
    None
  }

  pub fn validate(&self, n_taxa: usize) -> Result<(), Report> {
    if self.n_leaves() != n_taxa {
      return make_error!(
        "Tree has {} leaves but the alignment has {n_taxa} taxa",
        self.n_leaves()
      );
    }
    let mut seen = vec![false; n_taxa];
    for leaf in self.leaves() {
      let taxon = leaf.taxon.expect("Leaves carry a taxon index");
      if taxon >= n_taxa || seen[taxon] {
        return make_error!("Leaf '{}' has invalid or duplicate taxon index {taxon}", leaf.id);
      }
      seen[taxon] = true;
      if leaf.degree() != 1 {
        return make_error!("Leaf node {} must have exactly one branch, found {}", leaf.id, leaf.degree());
      }
    }
    for node in &self.nodes {
      if !node.is_leaf() && node.degree() < 3 {
        return make_error!(
          "Internal node {} has degree {}; unrooted trees need internal degree of at least 3",
          node.id,
          node.degree()
        );
      }
    }
    // Connectivity: every node reachable from node 0
    if !self.nodes.is_empty() {
      let mut visited = vec![false; self.nodes.len()];
      let mut stack = vec![0];
      visited[0] = true;
      while let Some(node) = stack.pop() {
        for &branch in &self.nodes[node].branches {
          let next = self.branches[branch].other(node);
          if !visited[next] {
            visited[next] = true;
            stack.push(next);
          }
        }
      }
      if visited.iter().any(|&v| !v) {
        return make_internal_error!("Tree is not connected");
      }
    }
    Ok(())
  }

  /// Convenience builder: an unrooted caterpillar over `n` taxa with uniform
  /// branch lengths. Taxon `i` maps to leaf `i`.
  pub fn caterpillar(n: usize, branch_length: f64) -> Result<Self, Report> {
    if n < 3 {
      return make_error!("Caterpillar tree needs at least 3 taxa, got {n}");
    }
    let mut tree = Self::new();
    let leaves: Vec<NodeId> = (0..n).map(|i| tree.add_leaf(format!("t{i}"), i)).collect();
    let mut spine = tree.add_internal();
    tree.connect(leaves[0], spine, branch_length)?;
    tree.connect(leaves[1], spine, branch_length)?;
    for &leaf in &leaves[2..n - 1] {
      let next = tree.add_internal();
      tree.connect(spine, next, branch_length)?;
      tree.connect(leaf, next, branch_length)?;
      spine = next;
    }
    tree.connect(leaves[n - 1], spine, branch_length)?;
    Ok(tree)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn star3() -> (Tree, [BranchId; 3]) {
    let mut tree = Tree::new();
    let center = tree.add_internal();
    let a = tree.add_leaf("a", 0);
    let b = tree.add_leaf("b", 1);
    let c = tree.add_leaf("c", 2);
    let ba = tree.connect(center, a, 0.1).unwrap();
    let bb = tree.connect(center, b, 0.2).unwrap();
    let bc = tree.connect(center, c, 0.3).unwrap();
    (tree, [ba, bb, bc])
  }

  #[test]
  fn test_star_validates() {
    let (tree, _) = star3();
    tree.validate(3).unwrap();
    assert_eq!(tree.n_leaves(), 3);
    assert_eq!(tree.n_branches(), 3);
  }

  #[test]
  fn test_views_are_directional() {
    let (tree, [ba, ..]) = star3();
    let branch = tree.branch(ba);
    let [center, leaf] = branch.nodes;
    branch.view(center).write().computed = true;
    assert!(branch.view(center).read().computed);
    assert!(!branch.view(leaf).read().computed);
  }

  #[test]
  fn test_invalidate_dependents_clears_inward_views() {
    let tree = Tree::caterpillar(4, 0.1).unwrap();
    for branch in tree.branches() {
      for &node in &branch.nodes {
        branch.view(node).write().computed = true;
      }
    }
    // Pendant branch of taxon 0: every view looking across it goes stale,
    // both views of the branch itself stay valid
    let leaf0 = tree.leaves().find(|leaf| leaf.taxon == Some(0)).unwrap();
    let pendant = leaf0.branches[0];
    tree.invalidate_dependents(pendant);
    for &node in &tree.branch(pendant).nodes {
      assert!(tree.branch(pendant).view(node).read().computed);
    }
    let stale: usize = tree
      .branches()
      .iter()
      .flat_map(|branch| branch.nodes.iter().map(move |&node| !branch.view(node).read().computed))
      .map(usize::from)
      .sum();
    // One stale view per branch on the path away from the leaf
    assert_eq!(stale, tree.n_branches() - 1);
  }

  #[test]
  fn test_caterpillar_shape() {
    let tree = Tree::caterpillar(5, 0.5).unwrap();
    tree.validate(5).unwrap();
    assert_eq!(tree.n_nodes(), 8);
    assert_eq!(tree.n_branches(), 7);
  }

  #[test]
  fn test_rejects_duplicate_branch() {
    let mut tree = Tree::new();
    let a = tree.add_internal();
    let b = tree.add_leaf("b", 0);
    tree.connect(a, b, 0.1).unwrap();
    assert!(tree.connect(a, b, 0.2).is_err());
  }
}
