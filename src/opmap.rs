//! Topological operator registry with an ancestor-reachability index.
//!
//! Assigns each registered operator a contiguous id such that an ancestor's id
//! is always smaller than a descendant's, and keeps the full
//! ancestor/descendant relation in one triangular bit index. On top of that it
//! answers the question the [`Plan`](crate::plan::Plan) builder keeps asking:
//! which operators are the *lowest* common ancestors of two inputs.

use std::collections::HashMap;

use crate::graph::PlanGraph;
use crate::op_id::OpId;
use crate::opset::OpSet;

/// Registry of operators in topological order, with ancestor queries.
#[derive(Default)]
pub struct OperatorMap {
    ids: HashMap<OpId, usize>,
    ops: Vec<OpId>,
    // Bit (d*(d-1)/2 + a) set iff a is an ancestor of d.
    ancestors: OpSet,
}

impl OperatorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator and, first, all of its ancestors.
    ///
    /// Registration is topological by construction: parents are inserted
    /// before the operator itself. Returns the operator's map id.
    pub fn add(&mut self, graph: &PlanGraph, op: OpId) -> usize {
        if let Some(&id) = self.ids.get(&op) {
            return id;
        }

        let parents = graph.parents(op).to_vec();
        let parent_ids: Vec<usize> = parents.iter().map(|&p| self.add(graph, p)).collect();

        let id = self.ops.len();
        self.ops.push(op);
        self.ids.insert(op, id);

        for parent_id in parent_ids {
            self.mark_ancestors(parent_id, id);
        }
        id
    }

    /// Map id of an already-registered operator.
    pub fn id(&self, op: OpId) -> Option<usize> {
        self.ids.get(&op).copied()
    }

    /// Operator behind a map id.
    ///
    /// # Panics
    ///
    /// Panics on an id this map never issued.
    pub fn op(&self, id: usize) -> OpId {
        self.ops[id]
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn tri(ancestor: usize, descendant: usize) -> usize {
        debug_assert!(ancestor <= descendant);
        descendant * descendant.saturating_sub(1) / 2 + ancestor
    }

    /// True if `ancestor` is a strict ancestor of `descendant` (map ids).
    pub fn is_ancestor(&self, ancestor: usize, descendant: usize) -> bool {
        descendant > ancestor && self.ancestors.contains(Self::tri(ancestor, descendant))
    }

    fn mark_ancestors(&mut self, parent: usize, child: usize) {
        assert!(
            child > parent,
            "operator map registration out of topological order ({parent} -> {child})"
        );
        self.ancestors.insert(Self::tri(parent, child));

        // The parent's own ancestors were marked when it was registered.
        let parent_from = Self::tri(0, parent);
        let child_from = Self::tri(0, child);
        for i in 0..parent {
            if self.ancestors.contains(parent_from + i) {
                self.ancestors.insert(child_from + i);
            }
        }
    }

    /// All ancestors of `id`, as a set of map ids below `id`.
    pub fn ancestors_of(&self, id: usize) -> OpSet {
        self.ancestors_below(id, id)
    }

    /// Ancestors of `id` restricted to map ids `< max_exclusive`.
    fn ancestors_below(&self, id: usize, max_exclusive: usize) -> OpSet {
        let mut set = OpSet::new();
        if id == 0 {
            return set;
        }
        let from = Self::tri(0, id);
        for i in 0..id.min(max_exclusive) {
            if self.ancestors.contains(from + i) {
                set.insert(i);
            }
        }
        set
    }

    /// Lowest common ancestors of two registered operators.
    ///
    /// Candidates are the common ancestors of both (an operator counts as its
    /// own ancestor here, so one input being upstream of the other yields that
    /// input itself); ancestors-of-ancestors are then stripped from the
    /// highest id down, leaving only the lowest ones. Returned as map ids in
    /// descending order.
    pub fn find_lcas(&self, op1: OpId, op2: OpId) -> Vec<usize> {
        let a = self.ids[&op1];
        let b = self.ids[&op2];
        if a == b {
            return vec![a];
        }
        let (id1, id2) = if a <= b { (a, b) } else { (b, a) };

        let mut candidates = self.ancestors_of(id1);
        candidates.insert(id1);
        candidates = candidates.intersection(&self.ancestors_below(id2, id1 + 1));

        let mut selected = Vec::new();
        while let Some(id) = candidates.max() {
            candidates.remove(id);
            candidates.subtract(&self.ancestors_of(id));
            selected.push(id);
        }
        selected
    }

    /// Bitset of map ids for a list of registered operators.
    pub fn set_of(&self, ops: &[OpId]) -> OpSet {
        ops.iter().map(|op| self.ids[op]).collect()
    }
}
