use index_vec::IndexVec;

use crate::engine::Fixing;

index_vec::define_index_type! {
	/// Slot of a node within one implication tree's arena.
	pub(crate) struct NodeId = u32;
}

/// The root sentinel occupies slot zero of every tree.
pub(crate) const ROOT: NodeId = NodeId { _raw: 0 };

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum NodeKind {
	#[default]
	Vacant,
	Root,
	/// A hypothetical fixing that starts a branch.
	Conditional,
	/// A fixing forced given the conditional ancestors on the path.
	Necessary,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Node {
	pub(crate) kind: NodeKind,
	pub(crate) fixing: Fixing,
	pub(crate) predecessor: Option<NodeId>,
	/// Kept normalised: a second successor implies a first.
	pub(crate) successors: [Option<NodeId>; 2],
}

/// One implication tree: a root sentinel plus two slots per entry, indexed by
/// `2·var + side`. At most two leaves are live at any time; either may be
/// `None` once its branch is pruned or satisfied.
#[derive(Clone, Debug, Default)]
pub(crate) struct Tree {
	nodes: IndexVec<NodeId, Node>,
	pub(crate) leaves: [Option<NodeId>; 2],
}

impl Tree {
	pub(crate) fn slot(var: usize, side: usize) -> NodeId {
		debug_assert!(side < 2);
		NodeId::from_usize(1 + 2 * var + side)
	}

	fn ensure(&mut self, nvars: usize) {
		if self.nodes.len() < 1 + 2 * nvars {
			self.nodes.resize(1 + 2 * nvars, Node::default());
		}
	}

	/// Prepare an empty tree: the root is its only node and the single live
	/// leaf.
	fn init(&mut self, nvars: usize) {
		self.ensure(nvars);
		debug_assert!(self.nodes.iter().all(|n| *n == Node::default()));
		self.nodes[ROOT].kind = NodeKind::Root;
		self.leaves = [Some(ROOT), None];
	}

	pub(crate) fn node(&self, id: NodeId) -> &Node {
		&self.nodes[id]
	}

	pub(crate) fn occupied(&self, id: NodeId) -> bool {
		self.nodes[id].kind != NodeKind::Vacant
	}

	pub(crate) fn kind(&self, id: NodeId) -> NodeKind {
		self.nodes[id].kind
	}

	pub(crate) fn fixing(&self, id: NodeId) -> Fixing {
		self.nodes[id].fixing
	}

	pub(crate) fn predecessor(&self, id: NodeId) -> Option<NodeId> {
		self.nodes[id].predecessor
	}

	/// The single successor of a path node.
	pub(crate) fn single_successor(&self, id: NodeId) -> Option<NodeId> {
		debug_assert!(self.nodes[id].successors[1].is_none());
		self.nodes[id].successors[0]
	}

	/// The other child of `id`'s parent.
	pub(crate) fn sibling(&self, id: NodeId) -> Option<NodeId> {
		let parent = self.nodes[id].predecessor?;
		let [a, b] = self.nodes[parent].successors;
		if a == Some(id) {
			b
		} else {
			debug_assert_eq!(b, Some(id));
			a
		}
	}

	/// Append a fresh node for `fixing` below `parent` in the slot of
	/// (`fixing.var`, `side`). Returns the new node.
	pub(crate) fn attach(
		&mut self,
		parent: NodeId,
		side: usize,
		kind: NodeKind,
		fixing: Fixing,
	) -> NodeId {
		let id = Self::slot(fixing.var, side);
		debug_assert!(!self.occupied(id));
		debug_assert!(matches!(kind, NodeKind::Conditional | NodeKind::Necessary));
		self.nodes[id] = Node {
			kind,
			fixing,
			predecessor: Some(parent),
			successors: [None; 2],
		};
		let succs = &mut self.nodes[parent].successors;
		if succs[0].is_none() {
			succs[0] = Some(id);
		} else {
			debug_assert!(succs[1].is_none());
			succs[1] = Some(id);
		}
		id
	}

	/// Detach `id` from its parent, keeping the successor pair normalised.
	fn unlink(&mut self, id: NodeId) {
		let Some(parent) = self.nodes[id].predecessor else {
			return;
		};
		let succs = &mut self.nodes[parent].successors;
		if succs[0] == Some(id) {
			succs[0] = succs[1];
			succs[1] = None;
		} else {
			debug_assert_eq!(succs[1], Some(id));
			succs[1] = None;
		}
	}

	/// Delete the subtree rooted at `id`, including `id`, vacating every slot
	/// and dropping leaves that pointed into it.
	pub(crate) fn remove_subtree(&mut self, id: NodeId) {
		self.unlink(id);
		self.remove_rec(id);
	}

	fn remove_rec(&mut self, id: NodeId) {
		let succs = self.nodes[id].successors;
		self.nodes[id] = Node::default();
		if self.leaves[0] == Some(id) {
			self.leaves[0] = None;
		}
		if self.leaves[1] == Some(id) {
			self.leaves[1] = None;
		}
		for s in succs.into_iter().flatten() {
			self.remove_rec(s);
		}
	}

	/// Remove a single-child node whose recorded fixing has been applied: its
	/// children become children of its parent. Returns the parent. Any leaf
	/// that pointed at `id` moves to the parent.
	pub(crate) fn splice_out(&mut self, id: NodeId) -> NodeId {
		let node = self.nodes[id];
		let parent = node.predecessor.expect("cannot splice out the root");
		debug_assert_eq!(self.nodes[parent].successors, [Some(id), None]);
		self.nodes[parent].successors = node.successors;
		for s in node.successors.into_iter().flatten() {
			self.nodes[s].predecessor = Some(parent);
		}
		self.nodes[id] = Node::default();
		if self.leaves[0] == Some(id) {
			self.leaves[0] = Some(parent);
		}
		if self.leaves[1] == Some(id) {
			self.leaves[1] = Some(parent);
		}
		parent
	}

	/// Turn a childless conditional node into the necessary fixing of the
	/// opposite value.
	pub(crate) fn flip_to_necessary(&mut self, id: NodeId) {
		debug_assert_eq!(self.nodes[id].kind, NodeKind::Conditional);
		self.nodes[id].kind = NodeKind::Necessary;
		self.nodes[id].fixing = self.nodes[id].fixing.flipped();
	}

	/// Promote `promoted` (the single child of `kept`) one step toward the
	/// root, so the path becomes parent → promoted → kept → old children of
	/// promoted. A leaf on `promoted` moves to `kept`.
	pub(crate) fn promote_over(&mut self, promoted: NodeId, kept: NodeId) {
		let parent = self.nodes[kept].predecessor.expect("promotion below the root");
		debug_assert_eq!(self.nodes[kept].successors, [Some(promoted), None]);
		debug_assert_eq!(self.nodes[parent].successors, [Some(kept), None]);
		let grandchildren = self.nodes[promoted].successors;
		for s in grandchildren.into_iter().flatten() {
			self.nodes[s].predecessor = Some(kept);
		}
		self.nodes[kept].successors = grandchildren;
		self.nodes[kept].predecessor = Some(promoted);
		self.nodes[promoted].predecessor = Some(parent);
		self.nodes[promoted].successors = [Some(kept), None];
		self.nodes[parent].successors = [Some(promoted), None];
		if self.leaves[0] == Some(promoted) {
			self.leaves[0] = Some(kept);
		}
		if self.leaves[1] == Some(promoted) {
			self.leaves[1] = Some(kept);
		}
	}

	/// The fixing of the root's child if it is a necessary node. Such a child
	/// is always the only child.
	pub(crate) fn root_necessary_child(&self) -> Option<Fixing> {
		let child = self.nodes[ROOT].successors[0]?;
		if self.nodes[child].kind == NodeKind::Necessary {
			debug_assert!(self.nodes[ROOT].successors[1].is_none());
			Some(self.nodes[child].fixing)
		} else {
			None
		}
	}

	pub(crate) fn root_has_conditional_child(&self) -> bool {
		self.nodes[ROOT]
			.successors
			.iter()
			.flatten()
			.any(|&s| self.nodes[s].kind == NodeKind::Conditional)
	}

	/// The recorded fixing of `var` on the path of `side`, falling back to
	/// the opposite slot (nodes created before a branching may sit on either
	/// side).
	pub(crate) fn recorded_value(&self, var: usize, side: usize) -> Option<bool> {
		for s in [side, 1 - side] {
			let id = Self::slot(var, s);
			if self.occupied(id) {
				debug_assert_eq!(self.nodes[id].fixing.var, var);
				return Some(self.nodes[id].fixing.value);
			}
		}
		None
	}

	/// Reset the tree to all-vacant, recycling the arena.
	pub(crate) fn clear(&mut self) {
		if !self.nodes.is_empty() && self.occupied(ROOT) {
			self.remove_subtree(ROOT);
		}
		self.leaves = [None; 2];
		debug_assert!(self.nodes.iter().all(|n| *n == Node::default()));
	}
}

/// The per-power trees of one propagation pass, together with the queue of
/// powers whose completeness conditions must be re-established.
#[derive(Clone, Debug, Default)]
pub(crate) struct Forest {
	trees: Vec<Tree>,
	pows: Vec<u64>,
	cursors: Vec<usize>,
	in_queue: Vec<bool>,
	queue: Vec<usize>,
}

impl Forest {
	/// Initialise `nperms` empty trees tracking the powers
	/// `base_pow, 2·base_pow, …` and schedule all of them.
	pub(crate) fn start(&mut self, nvars: usize, nperms: usize, base_pow: u64) {
		if self.trees.len() < nperms {
			self.trees.resize_with(nperms, Tree::default);
			self.pows.resize(nperms, 0);
			self.cursors.resize(nperms, 0);
			self.in_queue.resize(nperms, false);
		}
		debug_assert!(self.queue.is_empty());
		self.queue.clear();
		for k in 0..nperms {
			self.trees[k].init(nvars);
			self.pows[k] = (k as u64 + 1) * base_pow;
			self.cursors[k] = 0;
			self.in_queue[k] = true;
			self.queue.push(k);
		}
	}

	pub(crate) fn tree(&self, k: usize) -> &Tree {
		&self.trees[k]
	}

	pub(crate) fn tree_mut(&mut self, k: usize) -> &mut Tree {
		&mut self.trees[k]
	}

	pub(crate) fn pow(&self, k: usize) -> u64 {
		self.pows[k]
	}

	pub(crate) fn cursor(&self, k: usize) -> usize {
		self.cursors[k]
	}

	pub(crate) fn advance_cursor(&mut self, k: usize) {
		self.cursors[k] += 1;
	}

	pub(crate) fn pop_perm(&mut self) -> Option<usize> {
		let k = self.queue.pop()?;
		self.in_queue[k] = false;
		Some(k)
	}

	pub(crate) fn requeue(&mut self, k: usize) {
		if !self.in_queue[k] {
			self.in_queue[k] = true;
			self.queue.push(k);
		}
	}

	/// Recycle the arenas of the first `nperms` trees and drop the queue.
	pub(crate) fn clear(&mut self, nperms: usize) {
		while let Some(k) = self.queue.pop() {
			self.in_queue[k] = false;
		}
		for tree in self.trees.iter_mut().take(nperms) {
			tree.clear();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fresh(nvars: usize) -> Tree {
		let mut tree = Tree::default();
		tree.init(nvars);
		tree
	}

	#[test]
	fn test_attach_and_leaves() {
		let mut tree = fresh(3);
		let a = tree.attach(ROOT, 0, NodeKind::Necessary, Fixing::new(1, false));
		tree.leaves[0] = Some(a);
		assert_eq!(tree.root_necessary_child(), Some(Fixing::new(1, false)));
		assert!(!tree.root_has_conditional_child());
		assert_eq!(tree.recorded_value(1, 0), Some(false));
		assert_eq!(tree.recorded_value(1, 1), Some(false));
		assert_eq!(tree.recorded_value(2, 0), None);
	}

	#[test]
	fn test_splice_out() {
		let mut tree = fresh(3);
		let a = tree.attach(ROOT, 0, NodeKind::Necessary, Fixing::new(0, false));
		let b = tree.attach(a, 0, NodeKind::Conditional, Fixing::new(1, true));
		tree.leaves[0] = Some(b);
		let parent = tree.splice_out(a);
		assert_eq!(parent, ROOT);
		assert!(!tree.occupied(Tree::slot(0, 0)));
		assert_eq!(tree.node(ROOT).successors, [Some(b), None]);
		assert_eq!(tree.predecessor(b), Some(ROOT));
		assert!(tree.root_has_conditional_child());
	}

	#[test]
	fn test_remove_subtree_clears_leaves() {
		let mut tree = fresh(4);
		let branch = tree.attach(ROOT, 0, NodeKind::Conditional, Fixing::new(0, false));
		let n0 = tree.attach(branch, 0, NodeKind::Necessary, Fixing::new(1, false));
		let c1 = tree.attach(ROOT, 1, NodeKind::Conditional, Fixing::new(1, true));
		let n1 = tree.attach(c1, 1, NodeKind::Necessary, Fixing::new(0, true));
		tree.leaves = [Some(n0), Some(n1)];
		tree.remove_subtree(branch);
		assert_eq!(tree.leaves, [None, Some(n1)]);
		assert!(!tree.occupied(branch));
		assert!(!tree.occupied(n0));
		assert_eq!(tree.node(ROOT).successors, [Some(c1), None]);
		tree.clear();
		assert_eq!(tree.leaves, [None, None]);
	}

	#[test]
	fn test_promote_over() {
		// root -> twin(cond) -> tsucc(necc) -> tail(necc) becomes
		// root -> tsucc -> twin -> tail after promotion.
		let mut tree = fresh(4);
		let twin = tree.attach(ROOT, 1, NodeKind::Conditional, Fixing::new(0, true));
		let tsucc = tree.attach(twin, 1, NodeKind::Necessary, Fixing::new(1, true));
		let tail = tree.attach(tsucc, 1, NodeKind::Necessary, Fixing::new(2, true));
		tree.leaves = [None, Some(tail)];
		tree.promote_over(tsucc, twin);
		assert_eq!(tree.node(ROOT).successors, [Some(tsucc), None]);
		assert_eq!(tree.single_successor(tsucc), Some(twin));
		assert_eq!(tree.single_successor(twin), Some(tail));
		assert_eq!(tree.predecessor(tail), Some(twin));
		assert_eq!(tree.root_necessary_child(), Some(Fixing::new(1, true)));
	}
}
