use crate::op_id::OpId;
use crate::order::Order;
use crate::plan::PlanDef;
use crate::task::{DotName, TaskFactory};
use crate::value::Document;
use anyhow::Result;
use std::sync::Arc;

/// Translation table for one union branch: `table[slot]` is the position of
/// that context entry in the branch's own layout, or `None` when the branch
/// has no such ancestor (the entry then reads as the joker sentinel).
pub(crate) type UnionTable = Vec<Option<usize>>;

/// One sort stream of a join: the joined operator together with the
/// context slots holding its id, one per input stream.
#[derive(Clone, Debug)]
pub(crate) struct JoinRef {
    pub op: OpId,
    pub context_indices: Vec<usize>,
}

#[derive(Clone)]
pub(crate) enum OperatorKind {
    /// Fixed sequence of documents, one tuple per document.
    Constant { documents: Vec<Document> },

    /// Cartesian product of the parent streams.
    Product,

    /// Concatenation of the parent streams. `tables` is filled during
    /// initialization and rewrites each branch's context into the
    /// union-wide layout.
    Union { tables: Vec<UnionTable> },

    /// Equi-join on the ids of `refs`, consuming parents sorted by `order`.
    /// `joins` is derived from `refs` during initialization.
    Join {
        refs: Vec<OpId>,
        order: Order,
        joins: Vec<JoinRef>,
    },

    /// Buffers the parent stream and sorts it by the ids of the `order`
    /// operators. `context_order` holds the resolved context slots.
    OrderBy {
        order: Order,
        context_order: Vec<usize>,
    },

    /// Collapses runs of tuples sharing the ids of `refs` into a single
    /// tuple holding a JSON array of the grouped documents.
    GroupBy { refs: Vec<OpId>, indices: Vec<usize> },

    /// Runs a task once per input tuple. `mappings` binds task parameter
    /// names to node positions of the input tuple.
    Task {
        factory: Arc<dyn TaskFactory>,
        mappings: Vec<(DotName, usize)>,
    },

    /// Stateless document transform, 0..n output documents per input.
    Function {
        name: String,
        #[allow(clippy::type_complexity)]
        f: Arc<dyn Fn(&[Document]) -> Result<Vec<Document>> + Send + Sync>,
    },

    /// Permutes node positions: output node `i` is input node
    /// `permutation[i]`. Context passes through unchanged.
    Reorder { permutation: Vec<usize> },

    /// Placeholder for a nested plan, expanded before initialization.
    SubPlan { plan: Arc<PlanDef> },
}

impl OperatorKind {
    pub(crate) fn label(&self) -> String {
        match self {
            OperatorKind::Constant { documents } => format!("constant({})", documents.len()),
            OperatorKind::Product => "product".into(),
            OperatorKind::Union { .. } => "union".into(),
            OperatorKind::Join { refs, .. } => format!("join({})", refs.len()),
            OperatorKind::OrderBy { order, .. } => format!("order-by({})", order.len()),
            OperatorKind::GroupBy { refs, .. } => format!("group-by({})", refs.len()),
            OperatorKind::Task { factory, .. } => format!("task {}", factory.id()),
            OperatorKind::Function { name, .. } => name.clone(),
            OperatorKind::Reorder { .. } => "reorder".into(),
            OperatorKind::SubPlan { plan } => format!("plan {}", plan.factory.id()),
        }
    }

    /// Whether the output sequence may be replayed from a per-run cache.
    pub(crate) fn cacheable(&self) -> bool {
        matches!(self, OperatorKind::Task { .. })
    }

    /// Operators whose ids this operator reads from its input context.
    pub(crate) fn direct_needs(&self) -> Vec<OpId> {
        match self {
            OperatorKind::Join { refs, .. } | OperatorKind::GroupBy { refs, .. } => refs.clone(),
            OperatorKind::OrderBy { order, .. } => order.items().collect(),
            _ => Vec::new(),
        }
    }

    /// Rewrites every auxiliary operator reference through `resolve`.
    /// Parent edges are stored on the graph record, not here.
    pub(crate) fn redirect_refs(&mut self, resolve: &mut impl FnMut(OpId) -> OpId) {
        match self {
            OperatorKind::Join {
                refs, order, joins, ..
            } => {
                for r in refs.iter_mut() {
                    *r = resolve(*r);
                }
                order.redirect(&mut *resolve);
                for j in joins.iter_mut() {
                    j.op = resolve(j.op);
                }
            }
            OperatorKind::GroupBy { refs, .. } => {
                for r in refs.iter_mut() {
                    *r = resolve(*r);
                }
            }
            OperatorKind::OrderBy { order, .. } => order.redirect(&mut *resolve),
            _ => {}
        }
    }
}
