//! Graph passes that run between authoring and iteration.
//!
//! A snapshot goes through three passes before it can be iterated:
//!
//! 1. **Expand nested plans** -- every reachable [`OperatorKind::SubPlan`]
//!    placeholder is replaced by the plan's operator graph, memoized so a
//!    plan referenced twice expands once.
//! 2. **Simplify** -- pass-through operators (single-parent unions and
//!    products, sorts with an empty order) collapse into their parent.
//! 3. **Initialize** -- a needed-streams analysis decides which operator ids
//!    each output context must carry, then every operator gets its slot
//!    layout and kind-specific indices.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::graph::{ContextSource, PlanGraph};
use crate::op_id::OpId;
use crate::operator::{JoinRef, OperatorKind};
use crate::plan::{self, PlanDef};

/* ---------- Nested plan expansion ---------- */

/// Replace every reachable nested-plan placeholder with the plan's operator
/// graph. Parent edges and auxiliary references pointing at a placeholder
/// are redirected to its expansion. Returns the root of the expanded graph.
///
/// # Errors
///
/// Fails when an expanded plan has no input set at all.
pub(crate) fn prepare(graph: &mut PlanGraph, root: OpId) -> Result<OpId> {
    let mut expanded: HashMap<*const PlanDef, OpId> = HashMap::new();
    let mut subs: HashMap<OpId, OpId> = HashMap::new();
    let mut root = root;

    loop {
        let target = reachable(graph, root).into_iter().find_map(|id| {
            if let OperatorKind::SubPlan { plan } = graph.kind(id) {
                Some((id, Arc::clone(plan)))
            } else {
                None
            }
        });
        let Some((id, def)) = target else {
            break;
        };

        let op = plan::build_operator(graph, &def, &mut expanded)?;
        debug!(placeholder = %id, operator = %op, "expanded nested plan");
        subs.insert(id, op);

        let mut resolve = |mut x: OpId| {
            while let Some(&y) = subs.get(&x) {
                x = y;
            }
            x
        };
        for other in graph.ids().collect::<Vec<_>>() {
            let rec = graph.record_mut(other);
            for p in rec.parents.iter_mut() {
                *p = resolve(*p);
            }
            rec.kind.redirect_refs(&mut resolve);
        }
        root = resolve(root);
    }

    Ok(root)
}

/* ---------- Simplification ---------- */

/// Collapse operators that cannot change their input stream: unions and
/// products over a single parent, and sorts with nothing to sort on.
/// Auxiliary references follow a collapsed operator to its replacement.
/// Runs to a fixed point and returns the (possibly replaced) root.
pub(crate) fn simplify(graph: &mut PlanGraph, mut root: OpId) -> OpId {
    loop {
        // Collapsed operators stay in the arena but drop out of the
        // reachable set once their consumers are rewritten.
        let ops = reachable(graph, root);
        let mut subs: HashMap<OpId, OpId> = HashMap::new();
        for &id in &ops {
            let rec = graph.record(id);
            let collapse = match &rec.kind {
                OperatorKind::Union { .. } | OperatorKind::Product
                    if rec.parents.len() == 1 =>
                {
                    Some(rec.parents[0])
                }
                OperatorKind::OrderBy { order, .. } if order.is_empty() => Some(rec.parents[0]),
                _ => None,
            };
            if let Some(parent) = collapse {
                subs.insert(id, parent);
            }
        }
        if subs.is_empty() {
            return root;
        }
        debug!(collapsed = subs.len(), "simplifying operator graph");

        let mut resolve = |mut x: OpId| {
            while let Some(&y) = subs.get(&x) {
                x = y;
            }
            x
        };
        for &id in &ops {
            let rec = graph.record_mut(id);
            for p in rec.parents.iter_mut() {
                *p = resolve(*p);
            }
            rec.kind.redirect_refs(&mut resolve);
        }
        root = resolve(root);
    }
}

/* ---------- Initialization ---------- */

/// Compute, for every operator reachable from `root`, which operator ids its
/// output context must carry and where each one comes from, then let each
/// kind resolve the slot indices it reads at run time. Parents are
/// initialized before their children.
///
/// # Panics
///
/// Panics when an auxiliary reference is not part of the referencing
/// operator's input context, or when a nested plan placeholder survived
/// preparation. Both are graph construction defects.
pub(crate) fn init(graph: &mut PlanGraph, root: OpId) {
    let ops = reachable(graph, root);

    let mut children: IndexMap<OpId, IndexSet<OpId>> = IndexMap::new();
    let mut sources: Vec<OpId> = Vec::new();
    for &id in &ops {
        let parents = graph.parents(id);
        if parents.is_empty() {
            sources.push(id);
        }
        for &p in parents {
            children.entry(p).or_default().insert(id);
        }
    }

    let mut needed: HashMap<OpId, IndexSet<OpId>> = HashMap::new();
    for &source in &sources {
        compute_needed(graph, &children, source, &mut needed);
    }
    debug!(root = %root, ops = ops.len(), "initializing operator graph");

    let mut done: IndexSet<OpId> = IndexSet::new();
    init_op(graph, root, &needed, &mut done);
}

/// Operators reachable from `root` through parent edges, in discovery order.
pub(crate) fn reachable(graph: &PlanGraph, root: OpId) -> IndexSet<OpId> {
    let mut out = IndexSet::new();
    let mut stack = vec![root];
    while let Some(op) = stack.pop() {
        if out.insert(op) {
            stack.extend(graph.parents(op).iter().rev());
        }
    }
    out
}

/// The ids `op`'s output context must carry: for every child, whatever that
/// child must itself emit (except the child's own id, which the child
/// provides) plus whatever the child directly reads.
fn compute_needed(
    graph: &PlanGraph,
    children: &IndexMap<OpId, IndexSet<OpId>>,
    op: OpId,
    needed: &mut HashMap<OpId, IndexSet<OpId>>,
) {
    if needed.contains_key(&op) {
        return;
    }
    needed.insert(op, IndexSet::new());

    let mut streams: IndexSet<OpId> = IndexSet::new();
    if let Some(kids) = children.get(&op) {
        for &child in kids {
            compute_needed(graph, children, child, needed);
            if let Some(from_child) = needed.get(&child) {
                streams.extend(from_child.iter().copied().filter(|&o| o != child));
            }
            streams.extend(graph.kind(child).direct_needs());
        }
    }
    needed.insert(op, streams);
}

/// Slot assignment for one operator: each needed id is looked up in the
/// parent streams in order, first stream carrying it wins; the operator's
/// own id, when needed downstream, always takes the last slot.
fn init_op(
    graph: &mut PlanGraph,
    op: OpId,
    needed: &HashMap<OpId, IndexSet<OpId>>,
    done: &mut IndexSet<OpId>,
) {
    if !done.insert(op) {
        return;
    }
    let parents = graph.parents(op).to_vec();
    for &p in &parents {
        init_op(graph, p, needed, done);
    }

    let mut layout: Vec<OpId> = Vec::new();
    let mut slots: Vec<ContextSource> = Vec::new();
    if let Some(streams) = needed.get(&op) {
        for &want in streams {
            if want == op {
                continue;
            }
            for (stream, &parent) in parents.iter().enumerate() {
                if let Some(slot) = graph.slot_of(parent, want) {
                    layout.push(want);
                    slots.push(ContextSource::Parent { stream, slot });
                    break;
                }
            }
        }
        if streams.contains(&op) {
            layout.push(op);
            slots.push(ContextSource::Own);
        }
    }

    let rec = graph.record_mut(op);
    rec.layout = layout;
    rec.sources = slots;

    post_init(graph, op);
}

/// Kind-specific part of initialization: output sizes and the slot indices
/// each operator reads while iterating.
fn post_init(graph: &mut PlanGraph, op: OpId) {
    let parents = graph.parents(op).to_vec();
    match graph.kind(op) {
        OperatorKind::Product => {
            let size = parents.iter().map(|&p| graph.record(p).output_size).sum();
            graph.record_mut(op).output_size = size;
        }

        OperatorKind::Join { order, .. } => {
            let size = parents.iter().map(|&p| graph.record(p).output_size).sum();
            let mut order = order.clone();
            order.flatten();
            let joins: Vec<JoinRef> = order
                .items()
                .map(|item| {
                    let context_indices = parents
                        .iter()
                        .map(|&parent| match graph.slot_of(parent, item) {
                            Some(slot) => slot,
                            None => panic!(
                                "join reference {item} missing from the input context of {}",
                                graph.label(op)
                            ),
                        })
                        .collect();
                    JoinRef {
                        op: item,
                        context_indices,
                    }
                })
                .collect();
            let rec = graph.record_mut(op);
            rec.output_size = size;
            if let OperatorKind::Join {
                order: o, joins: j, ..
            } = &mut rec.kind
            {
                *o = order;
                *j = joins;
            }
        }

        OperatorKind::OrderBy { order, .. } => {
            let mut order = order.clone();
            order.flatten();
            let parent = parents[0];
            let context_order: Vec<usize> = order
                .items()
                .map(|item| match graph.slot_of(parent, item) {
                    Some(slot) => slot,
                    None => panic!(
                        "sort operator {item} missing from the input context of {}",
                        graph.label(op)
                    ),
                })
                .collect();
            let size = graph.record(parent).output_size;
            let rec = graph.record_mut(op);
            rec.output_size = size;
            if let OperatorKind::OrderBy {
                order: o,
                context_order: c,
            } = &mut rec.kind
            {
                *o = order;
                *c = context_order;
            }
        }

        OperatorKind::GroupBy { refs, .. } => {
            let parent = parents[0];
            let indices: Vec<usize> = refs
                .iter()
                .map(|&r| match graph.slot_of(parent, r) {
                    Some(slot) => slot,
                    None => panic!(
                        "group reference {r} missing from the input context of {}",
                        graph.label(op)
                    ),
                })
                .collect();
            if let OperatorKind::GroupBy { indices: i, .. } = &mut graph.record_mut(op).kind {
                *i = indices;
            }
        }

        OperatorKind::Union { .. } => {
            // Every branch rewrites its context into the union-wide layout,
            // so the union reads its own slots back as a single stream.
            let layout = graph.record(op).layout.clone();
            let plain: Vec<OpId> = layout.iter().copied().filter(|&l| l != op).collect();
            let tables: Vec<Vec<Option<usize>>> = parents
                .iter()
                .map(|&parent| {
                    plain
                        .iter()
                        .map(|&want| graph.slot_of(parent, want))
                        .collect()
                })
                .collect();
            let size = graph.record(parents[0]).output_size;
            debug_assert!(
                parents.iter().all(|&p| graph.record(p).output_size == size),
                "union branches disagree on output arity"
            );
            let rec = graph.record_mut(op);
            rec.output_size = size;
            for (slot, source) in rec.sources.iter_mut().enumerate() {
                if !matches!(source, ContextSource::Own) {
                    *source = ContextSource::Parent { stream: 0, slot };
                }
            }
            if let OperatorKind::Union { tables: t } = &mut rec.kind {
                *t = tables;
            }
        }

        OperatorKind::Reorder { permutation } => {
            graph.record_mut(op).output_size = permutation.len();
        }

        OperatorKind::SubPlan { .. } => {
            panic!(
                "nested plan operator survived preparation: {}",
                graph.label(op)
            )
        }

        OperatorKind::Constant { .. } | OperatorKind::Task { .. } | OperatorKind::Function { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Order;
    use crate::value::Document;

    #[test]
    fn simplify_reaches_a_fixed_point() {
        let mut graph = PlanGraph::default();
        let constant = graph.add(
            OperatorKind::Constant {
                documents: vec![Document::Null],
            },
            Vec::new(),
        );
        let union = graph.add(OperatorKind::Union { tables: Vec::new() }, vec![constant]);
        let sorted = graph.add(
            OperatorKind::OrderBy {
                order: Order::new(),
                context_order: Vec::new(),
            },
            vec![union],
        );

        // Both pass-throughs collapse down to the constant...
        let root = simplify(&mut graph, sorted);
        assert_eq!(root, constant);
        // ...and a second pass finds nothing left to change.
        assert_eq!(simplify(&mut graph, root), constant);
    }
}
