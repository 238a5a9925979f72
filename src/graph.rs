//! Operator graph storage.
//!
//! Operators live in one arena per [`Workspace`] and reference each other by
//! [`OpId`]. The arena is append-only while a plan is being authored; running
//! a plan works on a [`PlanGraph`] snapshot so preparation and initialization
//! never mutate the workspace the handles point into.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::op_id::OpId;
use crate::operator::OperatorKind;

/// Where one output context slot takes its value from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContextSource {
    /// The id of the tuple produced by this operator.
    Own,
    /// A slot of one input stream's context.
    Parent { stream: usize, slot: usize },
}

/// One operator record. `layout` and `sources` are empty until the graph is
/// initialized; afterwards `layout[k]` names the operator whose id occupies
/// output context slot `k` and `sources[k]` says where that value comes from.
#[derive(Clone)]
pub(crate) struct OpRecord {
    pub name: Option<String>,
    pub kind: OperatorKind,
    pub parents: Vec<OpId>,
    pub output_size: usize,
    pub layout: Vec<OpId>,
    pub sources: Vec<ContextSource>,
}

/// Append-only arena of operator records; an [`OpId`] indexes into `ops`.
#[derive(Clone, Default)]
pub struct PlanGraph {
    ops: Vec<OpRecord>,
}

impl PlanGraph {
    pub(crate) fn add(&mut self, kind: OperatorKind, parents: Vec<OpId>) -> OpId {
        let id = OpId::new(self.ops.len());
        self.ops.push(OpRecord {
            name: None,
            kind,
            parents,
            output_size: 1,
            layout: Vec::new(),
            sources: Vec::new(),
        });
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = OpId> + use<> {
        (0..self.ops.len()).map(OpId::new)
    }

    pub(crate) fn record(&self, id: OpId) -> &OpRecord {
        &self.ops[id.raw()]
    }

    pub(crate) fn record_mut(&mut self, id: OpId) -> &mut OpRecord {
        &mut self.ops[id.raw()]
    }

    pub(crate) fn kind(&self, id: OpId) -> &OperatorKind {
        &self.ops[id.raw()].kind
    }

    pub(crate) fn parents(&self, id: OpId) -> &[OpId] {
        &self.ops[id.raw()].parents
    }

    /// Display label: the explicit name when one was set, the kind otherwise.
    pub(crate) fn label(&self, id: OpId) -> String {
        let rec = self.record(id);
        match &rec.name {
            Some(name) => format!("{name} [{}]", rec.kind.label()),
            None => rec.kind.label(),
        }
    }

    /// Slot of `op`'s id in the output context of `of`, if `of` carries it.
    pub(crate) fn slot_of(&self, of: OpId, op: OpId) -> Option<usize> {
        self.record(of).layout.iter().position(|&l| l == op)
    }

    /// Whether `ancestor` is reachable from `op` through parent edges,
    /// looking through nested plan placeholders into their bound inputs.
    pub(crate) fn reaches(&self, op: OpId, ancestor: OpId) -> bool {
        let mut stack = vec![op];
        let mut seen = vec![false; self.ops.len()];
        while let Some(cur) = stack.pop() {
            if cur == ancestor {
                return true;
            }
            if std::mem::replace(&mut seen[cur.raw()], true) {
                continue;
            }
            stack.extend_from_slice(self.parents(cur));
            if let OperatorKind::SubPlan { plan } = self.kind(cur) {
                stack.extend(plan.input_ops());
            }
        }
        false
    }

    /// Copy the subtree rooted at `root`: every ancestor is duplicated once
    /// (shared ancestors stay shared inside the copy) and auxiliary
    /// references are rewritten to the duplicates.
    pub(crate) fn copy_subtree(&mut self, root: OpId) -> OpId {
        let mut copies: HashMap<OpId, OpId> = HashMap::new();
        let copy = self.copy_walk(root, &mut copies);
        for &new_id in copies.values() {
            let mut kind = self.record(new_id).kind.clone();
            kind.redirect_refs(&mut |r| copies.get(&r).copied().unwrap_or(r));
            self.record_mut(new_id).kind = kind;
        }
        copy
    }

    fn copy_walk(&mut self, op: OpId, copies: &mut HashMap<OpId, OpId>) -> OpId {
        if let Some(&done) = copies.get(&op) {
            return done;
        }
        let parents = self.parents(op).to_vec();
        let new_parents: Vec<OpId> = parents
            .into_iter()
            .map(|p| self.copy_walk(p, copies))
            .collect();
        let mut rec = self.record(op).clone();
        rec.parents = new_parents;
        let id = OpId::new(self.ops.len());
        self.ops.push(rec);
        copies.insert(op, id);
        id
    }
}

/// Shared authoring container. Handles created from the same workspace can be
/// combined; the graph itself is behind a mutex so handles stay cheap to
/// clone and pass around.
pub struct Workspace {
    pub(crate) inner: Arc<Mutex<PlanGraph>>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlanGraph::default())),
        }
    }
}

impl Clone for Workspace {
    fn clone(&self) -> Self {
        Workspace {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, kind: OperatorKind, parents: Vec<OpId>) -> OpId {
        let mut g = self.inner.lock().unwrap();
        g.add(kind, parents)
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&PlanGraph) -> R) -> R {
        let g = self.inner.lock().unwrap();
        f(&g)
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut PlanGraph) -> R) -> R {
        let mut g = self.inner.lock().unwrap();
        f(&mut g)
    }

    /// Clone the current graph so a run can prepare and initialize it
    /// without affecting plans still being authored.
    pub(crate) fn snapshot(&self) -> PlanGraph {
        self.inner.lock().unwrap().clone()
    }

    pub(crate) fn same_as(&self, other: &Workspace) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
