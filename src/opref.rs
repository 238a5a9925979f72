//! Fluent handles over operators in a workspace.
//!
//! An [`OpRef`] is a cheap cloneable `(workspace, operator)` pair carrying
//! the authoring surface: combinators that append operators to the shared
//! arena, and the execution entry points that snapshot the graph, run the
//! planner passes and drain the root iterator.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::context::RunContext;
use crate::dot;
use crate::error::PlanError;
use crate::exec;
use crate::graph::{PlanGraph, Workspace};
use crate::op_id::OpId;
use crate::operator::OperatorKind;
use crate::order::Order;
use crate::plan;
use crate::planner;
use crate::task::{DotName, MergeFactory};
use crate::value::Document;

/// A handle to one operator of a [`Workspace`].
#[derive(Clone)]
pub struct OpRef {
    workspace: Workspace,
    op: OpId,
}

impl fmt::Debug for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpRef({})", self.workspace.with(|g| g.label(self.op)))
    }
}

impl Workspace {
    /// A named operator emitting the given documents, one tuple each.
    pub fn constant(&self, name: impl Into<String>, documents: Vec<Document>) -> OpRef {
        let op = self.with_mut(|g| {
            let op = g.add(OperatorKind::Constant { documents }, Vec::new());
            g.record_mut(op).name = Some(name.into());
            op
        });
        OpRef::new(self.clone(), op)
    }

    /// [`Workspace::constant`] over any serializable values.
    ///
    /// # Errors
    ///
    /// Fails when a value does not serialize to a JSON document.
    pub fn constant_of<T: Serialize>(
        &self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = T>,
    ) -> Result<OpRef> {
        let documents = values
            .into_iter()
            .map(|v| Ok(serde_json::to_value(v)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.constant(name, documents))
    }

    /// Concatenation of the given streams.
    ///
    /// # Errors
    ///
    /// Fails on an empty operator list.
    pub fn union_of(&self, inputs: &[OpRef]) -> Result<OpRef> {
        if inputs.is_empty() {
            return Err(PlanError::EmptyCombination { what: "union" }.into());
        }
        let parents = self.parents_of(inputs);
        let op = self.with_mut(|g| g.add(OperatorKind::Union { tables: Vec::new() }, parents));
        Ok(OpRef::new(self.clone(), op))
    }

    /// Combination of the given streams, joined on shared ancestors where
    /// they have any and crossed where they do not. Output node positions
    /// follow the argument order.
    ///
    /// # Errors
    ///
    /// Fails on an empty operator list.
    pub fn product_of(&self, inputs: &[OpRef]) -> Result<OpRef> {
        if inputs.is_empty() {
            return Err(PlanError::EmptyCombination { what: "product" }.into());
        }
        if inputs.len() == 1 {
            return Ok(inputs[0].clone());
        }
        let parents = self.parents_of(inputs);
        let op = self.with_mut(|g| {
            let merge = plan::lca_merge(g, &parents);
            let permutation = parents.iter().map(|p| merge.map[p]).collect();
            g.add(OperatorKind::Reorder { permutation }, vec![merge.operator])
        });
        Ok(OpRef::new(self.clone(), op))
    }

    /// The built-in merging task: combines the named streams through the
    /// shared-ancestor join path and emits one JSON object per combination,
    /// keyed by input name.
    ///
    /// # Errors
    ///
    /// Fails on an empty input list or a dotted input name.
    pub fn merge(&self, name: impl Into<String>, inputs: &[(&str, &OpRef)]) -> Result<OpRef> {
        if inputs.is_empty() {
            return Err(PlanError::EmptyCombination { what: "merge" }.into());
        }
        let mut names = Vec::with_capacity(inputs.len());
        for (raw, _) in inputs {
            let parsed = DotName::parse(raw);
            if !parsed.is_simple() {
                return Err(PlanError::DottedName { name: parsed }.into());
            }
            names.push(parsed);
        }
        let refs: Vec<OpRef> = inputs.iter().map(|(_, r)| (*r).clone()).collect();
        let parents = self.parents_of(&refs);
        let factory = Arc::new(MergeFactory::new(name));
        let op = self.with_mut(|g| {
            let merge = plan::lca_merge(g, &parents);
            let mappings = names
                .into_iter()
                .zip(&parents)
                .map(|(n, p)| (n, merge.map[p]))
                .collect();
            g.add(
                OperatorKind::Task { factory, mappings },
                vec![merge.operator],
            )
        });
        Ok(OpRef::new(self.clone(), op))
    }

    fn parents_of(&self, inputs: &[OpRef]) -> Vec<OpId> {
        inputs
            .iter()
            .map(|r| {
                debug_assert!(
                    r.workspace.same_as(self),
                    "operator handle from a different workspace"
                );
                r.op
            })
            .collect()
    }
}

impl OpRef {
    pub(crate) fn new(workspace: Workspace, op: OpId) -> Self {
        Self { workspace, op }
    }

    pub(crate) fn id(&self) -> OpId {
        self.op
    }

    /// Set the operator's display name, for graph exports and errors.
    #[must_use]
    pub fn named(self, name: impl Into<String>) -> Self {
        self.workspace
            .with_mut(|g| g.record_mut(self.op).name = Some(name.into()));
        self
    }

    /// Evaluate an RFC 6901 JSON Pointer against each tuple's first
    /// document, emitting the match when there is one and nothing otherwise.
    #[must_use]
    pub fn select(&self, pointer: impl Into<String>) -> OpRef {
        let pointer = pointer.into();
        let name = format!("select({pointer})");
        self.transform(name, move |nodes| {
            Ok(nodes
                .first()
                .and_then(|doc| doc.pointer(&pointer))
                .map(|found| vec![found.clone()])
                .unwrap_or_default())
        })
    }

    /// A named document transform: zero or more output documents per input
    /// tuple, each emitted as its own tuple with the input's provenance.
    #[must_use]
    pub fn transform(
        &self,
        name: impl Into<String>,
        f: impl Fn(&[Document]) -> Result<Vec<Document>> + Send + Sync + 'static,
    ) -> OpRef {
        let op = self.workspace.insert(
            OperatorKind::Function {
                name: name.into(),
                f: Arc::new(f),
            },
            vec![self.op],
        );
        OpRef::new(self.workspace.clone(), op)
    }

    /// Group this stream by the given ancestor operators: tuples agreeing on
    /// every grouping ancestor collapse into one tuple holding a JSON array
    /// of their documents.
    ///
    /// # Errors
    ///
    /// Fails when an argument is not an ancestor of this operator.
    pub fn group_by(&self, keys: &[OpRef]) -> Result<OpRef> {
        let refs: Vec<OpId> = keys.iter().map(|k| k.op).collect();
        self.workspace.with(|g| -> Result<()> {
            for (index, &key) in refs.iter().enumerate() {
                if !g.reaches(self.op, key) {
                    return Err(PlanError::NotAnAncestor { index }.into());
                }
            }
            Ok(())
        })?;

        let mut order = Order::new();
        for &r in &refs {
            order.add(r, false);
        }
        let op = self.workspace.with_mut(|g| {
            let sorted = g.add(
                OperatorKind::OrderBy {
                    order,
                    context_order: Vec::new(),
                },
                vec![self.op],
            );
            g.add(
                OperatorKind::GroupBy {
                    refs,
                    indices: Vec::new(),
                },
                vec![sorted],
            )
        });
        Ok(OpRef::new(self.workspace.clone(), op))
    }

    /// Structural clone of this operator's subtree: every ancestor is
    /// duplicated into a fresh operator, memoized so ancestors shared inside
    /// the subtree stay shared inside the copy. The clone carries no
    /// provenance of the original.
    #[must_use]
    pub fn copy(&self) -> OpRef {
        let op = self.workspace.with_mut(|g| g.copy_subtree(self.op));
        OpRef::new(self.workspace.clone(), op)
    }

    /// Run the plan rooted here and collect each output tuple's first
    /// document.
    ///
    /// # Errors
    ///
    /// Fails on a malformed plan or a task failure during iteration.
    pub fn run(&self, ctx: &RunContext) -> Result<Vec<Document>> {
        let (graph, root) = self.planned(true)?;
        collect(&graph, ctx, root)
    }

    /// [`OpRef::run`] under a simulate-mode fork of the context: tasks are
    /// asked to skip real side effects.
    ///
    /// # Errors
    ///
    /// As [`OpRef::run`].
    pub fn simulate(&self, ctx: &RunContext) -> Result<Vec<Document>> {
        self.run(&ctx.fork().simulating(true))
    }

    /// Simulate with detailed statistics: also returns the graph rendered as
    /// DOT, each node annotated with its emission count.
    ///
    /// # Errors
    ///
    /// As [`OpRef::run`].
    pub fn simulate_detailed(&self, ctx: &RunContext) -> Result<(Vec<Document>, String)> {
        let fork = ctx.fork().simulating(true).counting(true);
        let (graph, root) = self.planned(true)?;
        let documents = collect(&graph, &fork, root)?;
        let counts = fork.counts().unwrap_or_default();
        Ok((documents, dot::render(&graph, root, Some(&counts))))
    }

    /// Render the prepared (and optionally simplified) graph as DOT.
    ///
    /// # Errors
    ///
    /// Fails when the graph cannot be prepared.
    pub fn to_dot(&self, simplify: bool) -> Result<String> {
        let mut graph = self.workspace.snapshot();
        let mut root = planner::prepare(&mut graph, self.op)?;
        if simplify {
            root = planner::simplify(&mut graph, root);
        }
        Ok(dot::render(&graph, root, None))
    }

    /// Snapshot, prepare, simplify and initialize, leaving a graph ready to
    /// iterate.
    fn planned(&self, simplify: bool) -> Result<(PlanGraph, OpId)> {
        let mut graph = self.workspace.snapshot();
        let mut root = planner::prepare(&mut graph, self.op)?;
        if simplify {
            root = planner::simplify(&mut graph, root);
        }
        planner::init(&mut graph, root);
        Ok((graph, root))
    }

    /// Per-operator emission counts of a full run, keyed by display label.
    ///
    /// # Errors
    ///
    /// As [`OpRef::run`].
    pub fn run_counted(&self, ctx: &RunContext) -> Result<(Vec<Document>, HashMap<String, u64>)> {
        let fork = ctx.fork().counting(true);
        let (graph, root) = self.planned(true)?;
        let documents = collect(&graph, &fork, root)?;
        let counts = fork
            .counts()
            .unwrap_or_default()
            .into_iter()
            .map(|(op, n)| (graph.label(op), n))
            .collect();
        Ok((documents, counts))
    }
}

fn collect(graph: &PlanGraph, ctx: &RunContext, root: OpId) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    for item in exec::tuples(graph, ctx, root) {
        let tuple = item?;
        out.push(
            tuple
                .into_nodes()
                .into_iter()
                .next()
                .unwrap_or(Document::Null),
        );
    }
    Ok(out)
}
