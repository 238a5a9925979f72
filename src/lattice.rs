//! Lattice of ancestor sets used to merge plan inputs.
//!
//! Each input operator enters the lattice under the set of ancestors it must
//! agree on with its siblings. The lattice is stored upside down: the root
//! holds the union of all sets and parent edges lead to strict subsets.
//! Contraction then replaces groups of operators by joins keyed on their
//! shared ancestors, descending until a single operator is left.

use std::cmp::Reverse;
use std::collections::HashMap;

use tracing::debug;

use crate::graph::PlanGraph;
use crate::op_id::OpId;
use crate::operator::OperatorKind;
use crate::opmap::OperatorMap;
use crate::opset::OpSet;
use crate::order::Order;

type Ix = usize;

const ROOT: Ix = 0;

/// Outcome of a full merge: the operator producing the combined stream and,
/// for every operator that went in, the position of its node in the output.
pub(crate) struct MergeResult {
    pub operator: OpId,
    pub map: HashMap<OpId, usize>,
}

struct LatticeNode {
    set: OpSet,
    /// Strict subsets of this node's set.
    parents: Vec<Ix>,
    /// Back edges toward the root, filled when a merge starts.
    children: Vec<Ix>,
    /// Operators waiting to be merged at this level.
    operators: Vec<OpId>,
    result: Option<OpId>,
    /// Original operators folded into `result`, in node order.
    merged: Vec<OpId>,
    /// Pending work in this node and its whole sub-lattice.
    nb: usize,
    heap_pos: Option<usize>,
}

impl LatticeNode {
    fn new(set: OpSet) -> Self {
        Self {
            set,
            parents: Vec::new(),
            children: Vec::new(),
            operators: Vec::new(),
            result: None,
            merged: Vec::new(),
            nb: 0,
            heap_pos: None,
        }
    }

    fn pending(&self) -> usize {
        self.operators.len() + usize::from(self.result.is_some())
    }
}

enum Inclusion {
    Null,
    Different,
    Equals,
    Includes,
    Included,
}

/// Relationship between two sets, read as `a RELATION b`.
fn inclusion(a: &OpSet, b: &OpSet) -> Inclusion {
    let common = a.intersection_size(b);
    if common == 0 {
        return Inclusion::Null;
    }
    if common == b.len() {
        if common == a.len() {
            Inclusion::Equals
        } else {
            Inclusion::Includes
        }
    } else if common == a.len() {
        Inclusion::Included
    } else {
        Inclusion::Different
    }
}

pub(crate) struct Lattice {
    nodes: Vec<LatticeNode>,
}

impl Lattice {
    pub fn new() -> Self {
        Self {
            nodes: vec![LatticeNode::new(OpSet::new())],
        }
    }

    /* ---------- Insertion ---------- */

    /// Add an operator under the set of ancestor ids it joins on. Operators
    /// with equal sets share a node; an empty set hangs directly off the
    /// root and ends up in a product.
    pub fn add(&mut self, set: OpSet, operator: OpId) {
        let ix = self.nodes.len();
        let mut node = LatticeNode::new(set);
        node.operators.push(operator);
        self.nodes.push(node);
        self.insert(ROOT, ix, None);
    }

    /// Insert `node` below `at`. Returns the node it ended up in: `node`
    /// itself, an existing node with the same set, or `None` when this
    /// branch does not contain it.
    fn insert(&mut self, at: Ix, mut node: Ix, incoming: Option<(Ix, usize)>) -> Option<Ix> {
        let status = if at == ROOT {
            Inclusion::Includes
        } else {
            inclusion(&self.nodes[at].set, &self.nodes[node].set)
        };

        match status {
            Inclusion::Different => {
                // Not insertable here, but subsets of `node` may live in
                // this branch and must become its parents.
                self.connect(at, node);
                None
            }

            Inclusion::Null => None,

            Inclusion::Equals => {
                let pending = std::mem::take(&mut self.nodes[node].operators);
                for op in pending {
                    if !self.nodes[at].operators.contains(&op) {
                        self.nodes[at].operators.push(op);
                    }
                }
                Some(at)
            }

            Inclusion::Includes => {
                let mut inserted: Option<Ix> = None;
                let mut i = 0;
                while i < self.nodes[at].parents.len() {
                    let parent = self.nodes[at].parents[i];
                    if let Some(found) = self.insert(parent, node, Some((at, i))) {
                        if inserted.is_some() {
                            // Already reachable through an earlier parent.
                            self.nodes[at].parents.remove(i);
                            continue;
                        }
                        inserted = Some(found);
                        node = found;
                    }
                    i += 1;
                }
                match inserted {
                    Some(found) => Some(found),
                    None => {
                        self.nodes[at].parents.push(node);
                        Some(node)
                    }
                }
            }

            Inclusion::Included => {
                // `node` sits between `at` and the edge we came through.
                self.nodes[node].parents.push(at);
                if let Some((owner, pos)) = incoming {
                    self.nodes[owner].parents[pos] = node;
                }
                Some(node)
            }
        }
    }

    /// Link every node of this branch that is a subset of `node` to it.
    fn connect(&mut self, at: Ix, node: Ix) {
        match inclusion(&self.nodes[at].set, &self.nodes[node].set) {
            Inclusion::Includes | Inclusion::Equals => {
                panic!("lattice insertion reached a superset while connecting")
            }
            Inclusion::Null => {}
            Inclusion::Included => {
                if !self.nodes[node].parents.contains(&at) {
                    self.nodes[node].parents.push(at);
                }
            }
            Inclusion::Different => {
                let parents = self.nodes[at].parents.clone();
                for p in parents {
                    self.connect(p, node);
                }
            }
        }
    }

    /* ---------- Contraction ---------- */

    /// Merge everything that was added and return the single resulting
    /// operator together with the node position of every input.
    ///
    /// # Panics
    ///
    /// Panics when nothing was added to the lattice.
    pub fn merge(mut self, graph: &mut PlanGraph, opmap: &OperatorMap) -> MergeResult {
        debug!(nodes = self.nodes.len() - 1, "contracting lattice");

        let mut heap = NodeHeap::default();
        self.build(&mut heap);
        while let Some(top) = heap.peek() {
            if self.nodes[top].operators.len() > 1 {
                self.merge_level(graph, opmap, &mut heap, top);
            } else {
                self.fold_up(graph, opmap, &mut heap, top);
            }
        }

        let Some((operator, merged)) = self.fold_root(graph, opmap) else {
            panic!("no result operator at the lattice root");
        };
        let map = merged.iter().enumerate().map(|(i, &op)| (op, i)).collect();
        MergeResult { operator, map }
    }

    /// Register back edges, promote single-operator nodes to results, count
    /// pending work per sub-lattice and seed the heap.
    fn build(&mut self, heap: &mut NodeHeap) {
        let mut visited = vec![false; self.nodes.len()];
        self.build_node(ROOT, &mut visited);
        for ix in 1..self.nodes.len() {
            if !visited[ix] {
                continue;
            }
            let node = &self.nodes[ix];
            let done = node.nb == 1 && node.parents.is_empty() && self.root_parent_only(ix);
            if !done {
                heap.push(&mut self.nodes, ix);
            }
        }
    }

    fn build_node(&mut self, ix: Ix, visited: &mut [bool]) {
        if std::mem::replace(&mut visited[ix], true) {
            return;
        }
        if self.nodes[ix].operators.len() == 1 && self.nodes[ix].result.is_none() {
            let op = self.nodes[ix].operators.remove(0);
            self.nodes[ix].result = Some(op);
            self.nodes[ix].merged.push(op);
        }
        let parents = self.nodes[ix].parents.clone();
        let mut nb = self.nodes[ix].pending();
        for p in parents {
            self.nodes[p].children.push(ix);
            self.build_node(p, visited);
            nb += self.nodes[p].nb;
        }
        self.nodes[ix].nb = nb;
    }

    /// Several operators share this node's set: join them all on it.
    fn merge_level(
        &mut self,
        graph: &mut PlanGraph,
        opmap: &OperatorMap,
        heap: &mut NodeHeap,
        ix: Ix,
    ) {
        let ops = std::mem::take(&mut self.nodes[ix].operators);
        let set = self.nodes[ix].set.clone();
        let result = merge_ops(graph, opmap, ops.clone(), &set);
        self.nodes[ix].result = Some(result);
        self.nodes[ix].merged = ops;

        let nb = 1 + self.parents_nb(ix);
        self.nodes[ix].nb = nb;
        if self.nodes[ix].parents.is_empty() && self.root_parent_only(ix) {
            heap.remove(&mut self.nodes, ix);
        } else {
            heap.update(&mut self.nodes, ix);
        }
        self.update_children(heap, ix, false);
    }

    /// This node is fully resolved: push its result down into a child,
    /// joining on this node's own set.
    fn fold_up(
        &mut self,
        graph: &mut PlanGraph,
        opmap: &OperatorMap,
        heap: &mut NodeHeap,
        ix: Ix,
    ) {
        heap.remove(&mut self.nodes, ix);
        assert!(
            self.nodes[ix].parents.is_empty(),
            "lattice contraction reached a node with unresolved ancestors"
        );

        let Some(child) = self.nodes[ix].children.iter().copied().find(|&c| c != ROOT) else {
            // Only the root consumes this result, during the final fold.
            return;
        };

        let this_result = self.nodes[ix].result.take();
        let child_result = self.nodes[child].result.take();
        let (Some(a), Some(b)) = (child_result, this_result) else {
            panic!("lattice contraction folded an unresolved node");
        };
        let set = self.nodes[ix].set.clone();
        let merged = merge_ops(graph, opmap, vec![a, b], &set);
        self.nodes[child].result = Some(merged);
        let moved = std::mem::take(&mut self.nodes[ix].merged);
        self.nodes[child].merged.extend(moved);

        self.nodes[ix].nb = 0;
        self.update_children(heap, ix, true);
    }

    /// Recompute the pending count of every direct child, severing the edges
    /// to `ix` first when it was folded away.
    fn update_children(&mut self, heap: &mut NodeHeap, ix: Ix, sever: bool) {
        let mut children = self.nodes[ix].children.clone();
        children.dedup();
        for &child in &children {
            if sever {
                self.nodes[child].parents.retain(|&p| p != ix);
            }
            let nb = self.nodes[child].pending() + self.parents_nb(child);
            self.nodes[child].nb = nb;
            if child == ROOT {
                continue;
            }
            if nb == 1 && self.root_parent_only(child) {
                heap.remove(&mut self.nodes, child);
            } else {
                heap.update(&mut self.nodes, child);
            }
        }
    }

    /// Fold the root's remaining branches left to right. Each step joins the
    /// accumulated result with the next branch on the ancestors they share;
    /// independent branches meet in a product.
    fn fold_root(
        &mut self,
        graph: &mut PlanGraph,
        opmap: &OperatorMap,
    ) -> Option<(OpId, Vec<OpId>)> {
        let parents = self.nodes[ROOT].parents.clone();
        let mut acc: Option<(OpId, Vec<OpId>, OpSet)> = None;
        for p in parents {
            let node = &mut self.nodes[p];
            let result = match node.result.take() {
                Some(result) if node.operators.is_empty() => result,
                _ => panic!("unresolved lattice node at the root fold"),
            };
            let merged = std::mem::take(&mut node.merged);
            let set = node.set.clone();

            acc = Some(match acc {
                None => (result, merged, set),
                Some((acc_result, mut acc_merged, mut acc_set)) => {
                    let key = acc_set.intersection(&set);
                    let joined = merge_ops(graph, opmap, vec![acc_result, result], &key);
                    acc_merged.extend(merged);
                    acc_set.union_with(&set);
                    (joined, acc_merged, acc_set)
                }
            });
        }
        acc.map(|(result, merged, _)| (result, merged))
    }

    fn parents_nb(&self, ix: Ix) -> usize {
        self.nodes[ix]
            .parents
            .iter()
            .map(|&p| self.nodes[p].nb)
            .sum()
    }

    fn root_parent_only(&self, ix: Ix) -> bool {
        let children = &self.nodes[ix].children;
        !children.is_empty() && children.iter().all(|&c| c == ROOT)
    }
}

/// Merge operators into one, joining on the ids of `key`. A key member that
/// is an ancestor of another member is redundant: agreeing on the descendant
/// already fixes the ancestor.
fn merge_ops(graph: &mut PlanGraph, opmap: &OperatorMap, ops: Vec<OpId>, key: &OpSet) -> OpId {
    if ops.len() == 1 {
        return ops[0];
    }
    if key.is_empty() {
        return graph.add(OperatorKind::Product, ops);
    }

    let ids: Vec<usize> = key.iter().collect();
    let reduced: Vec<usize> = ids
        .iter()
        .copied()
        .filter(|&a| !ids.iter().any(|&d| d != a && opmap.is_ancestor(a, d)))
        .collect();

    let mut order = Order::new();
    let mut refs = Vec::new();
    for &id in &reduced {
        let op = opmap.op(id);
        refs.push(op);
        order.add(op, false);
    }

    let parents: Vec<OpId> = ops
        .into_iter()
        .map(|p| {
            graph.add(
                OperatorKind::OrderBy {
                    order: order.clone(),
                    context_order: Vec::new(),
                },
                vec![p],
            )
        })
        .collect();
    graph.add(
        OperatorKind::Join {
            refs,
            order,
            joins: Vec::new(),
        },
        parents,
    )
}

/* ---------- Contraction heap ---------- */

/// Binary heap over node indices with back pointers, so priorities can be
/// updated and arbitrary nodes removed as the lattice contracts. Nodes with
/// several pending operators come first, then nodes with fewer unresolved
/// subsets, then larger sub-lattices.
#[derive(Default)]
struct NodeHeap {
    items: Vec<Ix>,
}

impl NodeHeap {
    fn rank(node: &LatticeNode) -> (Reverse<usize>, usize, Reverse<usize>) {
        (
            Reverse(node.operators.len()),
            node.parents.len(),
            Reverse(node.nb),
        )
    }

    fn before(nodes: &[LatticeNode], a: Ix, b: Ix) -> bool {
        Self::rank(&nodes[a]) < Self::rank(&nodes[b])
    }

    fn peek(&self) -> Option<Ix> {
        self.items.first().copied()
    }

    fn push(&mut self, nodes: &mut [LatticeNode], ix: Ix) {
        nodes[ix].heap_pos = Some(self.items.len());
        self.items.push(ix);
        self.sift_up(nodes, self.items.len() - 1);
    }

    fn remove(&mut self, nodes: &mut [LatticeNode], ix: Ix) {
        let Some(pos) = nodes[ix].heap_pos.take() else {
            return;
        };
        let last = self.items.len() - 1;
        if pos != last {
            self.items.swap(pos, last);
            nodes[self.items[pos]].heap_pos = Some(pos);
        }
        self.items.pop();
        if pos < self.items.len() {
            let pos = self.sift_up(nodes, pos);
            self.sift_down(nodes, pos);
        }
    }

    fn update(&mut self, nodes: &mut [LatticeNode], ix: Ix) {
        let Some(pos) = nodes[ix].heap_pos else {
            return;
        };
        let pos = self.sift_up(nodes, pos);
        self.sift_down(nodes, pos);
    }

    fn sift_up(&mut self, nodes: &mut [LatticeNode], mut pos: usize) -> usize {
        while pos > 0 {
            let up = (pos - 1) / 2;
            if !Self::before(nodes, self.items[pos], self.items[up]) {
                break;
            }
            self.swap(nodes, pos, up);
            pos = up;
        }
        pos
    }

    fn sift_down(&mut self, nodes: &mut [LatticeNode], mut pos: usize) {
        loop {
            let mut best = pos;
            for child in [2 * pos + 1, 2 * pos + 2] {
                if child < self.items.len() && Self::before(nodes, self.items[child], self.items[best])
                {
                    best = child;
                }
            }
            if best == pos {
                return;
            }
            self.swap(nodes, pos, best);
            pos = best;
        }
    }

    fn swap(&mut self, nodes: &mut [LatticeNode], a: usize, b: usize) {
        self.items.swap(a, b);
        nodes[self.items[a]].heap_pos = Some(a);
        nodes[self.items[b]].heap_pos = Some(b);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::graph::PlanGraph;
    use crate::value::Document;

    fn constant(graph: &mut PlanGraph) -> OpId {
        graph.add(
            OperatorKind::Constant {
                documents: vec![Document::Null],
            },
            Vec::new(),
        )
    }

    fn function(graph: &mut PlanGraph, parent: OpId) -> OpId {
        graph.add(
            OperatorKind::Function {
                name: "id".into(),
                f: Arc::new(|nodes| Ok(nodes.to_vec())),
            },
            vec![parent],
        )
    }

    fn sets(lattice: &Lattice, ix: Ix) -> Vec<Vec<usize>> {
        let mut out: Vec<Vec<usize>> = lattice.nodes[ix]
            .parents
            .iter()
            .map(|&p| lattice.nodes[p].set.iter().collect())
            .collect();
        out.sort();
        out
    }

    fn dummy_ops(graph: &mut PlanGraph, n: usize) -> Vec<OpId> {
        (0..n).map(|_| constant(graph)).collect()
    }

    #[test]
    fn singletons_insert_under_a_triple() {
        let mut graph = PlanGraph::default();
        let ops = dummy_ops(&mut graph, 4);

        let mut lattice = Lattice::new();
        lattice.add(OpSet::of([0, 1, 2]), ops[0]);
        lattice.add(OpSet::of([0]), ops[1]);
        lattice.add(OpSet::of([1]), ops[2]);
        lattice.add(OpSet::of([2]), ops[3]);

        // The triple hangs off the root; each singleton hangs off the triple.
        assert_eq!(sets(&lattice, ROOT), vec![vec![0, 1, 2]]);
        let triple = lattice.nodes[ROOT].parents[0];
        assert_eq!(sets(&lattice, triple), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn diamond_insertion_splices_intermediate_nodes() {
        let mut graph = PlanGraph::default();
        let ops = dummy_ops(&mut graph, 5);

        let mut lattice = Lattice::new();
        for (i, set) in [
            OpSet::of([0]),
            OpSet::of([0, 1, 2]),
            OpSet::of([1, 2]),
            OpSet::of([2]),
            OpSet::of([0, 2]),
        ]
        .into_iter()
        .enumerate()
        {
            lattice.add(set, ops[i]);
        }

        assert_eq!(sets(&lattice, ROOT), vec![vec![0, 1, 2]]);
        let full = lattice.nodes[ROOT].parents[0];
        assert_eq!(sets(&lattice, full), vec![vec![0, 2], vec![1, 2]]);

        let find = |set: &[usize]| {
            (0..lattice.nodes.len())
                .find(|&ix| lattice.nodes[ix].set.iter().collect::<Vec<_>>() == set)
                .expect("node exists")
        };
        assert_eq!(sets(&lattice, find(&[0, 2])), vec![vec![0], vec![2]]);
        assert_eq!(sets(&lattice, find(&[1, 2])), vec![vec![2]]);
    }

    #[test]
    fn co_located_operators_merge_into_one_join() {
        let mut graph = PlanGraph::default();
        let shared = constant(&mut graph);
        let left = function(&mut graph, shared);
        let right = function(&mut graph, shared);

        let mut opmap = OperatorMap::new();
        opmap.add(&graph, left);
        opmap.add(&graph, right);
        let key = opmap.set_of(&[shared]);

        let mut lattice = Lattice::new();
        lattice.add(key.clone(), left);
        lattice.add(key, right);
        let merge = lattice.merge(&mut graph, &opmap);

        assert_eq!(merge.map[&left], 0);
        assert_eq!(merge.map[&right], 1);
        let OperatorKind::Join { refs, .. } = graph.kind(merge.operator) else {
            panic!("expected a join at the merge root");
        };
        assert_eq!(refs, &[shared]);
        // Each parent got wrapped in an order on the shared key.
        for &parent in graph.parents(merge.operator) {
            assert!(matches!(graph.kind(parent), OperatorKind::OrderBy { .. }));
        }
    }

    #[test]
    fn join_keys_reduce_to_lowest_members() {
        let mut graph = PlanGraph::default();
        let top = constant(&mut graph);
        let mid = function(&mut graph, top);
        let left = function(&mut graph, mid);
        let right = function(&mut graph, mid);

        let mut opmap = OperatorMap::new();
        opmap.add(&graph, left);
        opmap.add(&graph, right);
        // Requiring agreement on both: the descendant alone settles it.
        let key = opmap.set_of(&[top, mid]);

        let mut lattice = Lattice::new();
        lattice.add(key.clone(), left);
        lattice.add(key, right);
        let merge = lattice.merge(&mut graph, &opmap);

        let OperatorKind::Join { refs, .. } = graph.kind(merge.operator) else {
            panic!("expected a join at the merge root");
        };
        assert_eq!(refs, &[mid]);
    }

    #[test]
    fn disjoint_requirements_fold_into_a_product() {
        let mut graph = PlanGraph::default();
        let a = constant(&mut graph);
        let b = constant(&mut graph);

        let mut opmap = OperatorMap::new();
        opmap.add(&graph, a);
        opmap.add(&graph, b);

        let mut lattice = Lattice::new();
        lattice.add(OpSet::new(), a);
        lattice.add(OpSet::new(), b);
        let merge = lattice.merge(&mut graph, &opmap);

        assert!(matches!(graph.kind(merge.operator), OperatorKind::Product));
        assert_eq!(graph.parents(merge.operator), &[a, b]);
        assert_eq!(merge.map[&a], 0);
        assert_eq!(merge.map[&b], 1);
    }

    #[test]
    fn single_input_passes_through_unwrapped() {
        let mut graph = PlanGraph::default();
        let only = constant(&mut graph);

        let mut opmap = OperatorMap::new();
        opmap.add(&graph, only);

        let mut lattice = Lattice::new();
        lattice.add(OpSet::new(), only);
        let merge = lattice.merge(&mut graph, &opmap);

        assert_eq!(merge.operator, only);
        assert_eq!(merge.map[&only], 0);
    }
}
