//! Named-input plan builder.
//!
//! A [`Plan`] binds a task factory to one or more input sets. Each set maps
//! dotted parameter names to operators; building a set computes the lowest
//! common ancestors between every two inputs, feeds the resulting requirement
//! sets into a [`Lattice`](crate::lattice::Lattice) and wires the merged
//! join/product tree into a task operator. Alternative sets on the same plan
//! union at the end.
//!
//! Plans are usable as inputs of other plans: [`Plan::operator`] hands out a
//! placeholder that preparation expands, memoized per plan so two uses of the
//! same plan share one expansion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use indexmap::IndexMap;
use tracing::debug;

use crate::error::PlanError;
use crate::graph::{PlanGraph, Workspace};
use crate::lattice::{Lattice, MergeResult};
use crate::op_id::OpId;
use crate::operator::OperatorKind;
use crate::opmap::OperatorMap;
use crate::opref::OpRef;
use crate::opset::OpSet;
use crate::task::{DotName, TaskFactory};
use crate::value::Document;

/// One alternative binding of parameter names to input operators.
#[derive(Default)]
pub struct PlanInputs {
    pub(crate) bindings: IndexMap<DotName, Vec<OpId>>,
}

impl PlanInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an operator to a parameter name. Binding the same name several
    /// times accumulates alternatives; they union when the plan is built.
    #[must_use]
    pub fn bind(mut self, name: impl Into<DotName>, input: &OpRef) -> Self {
        self.bindings
            .entry(name.into())
            .or_default()
            .push(input.id());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// The shared definition behind a plan: its factory and every input set
/// added so far. Placeholder operators hold an `Arc` of this, so input sets
/// added after `operator()` was called are still picked up at expansion.
pub(crate) struct PlanDef {
    pub factory: Arc<dyn TaskFactory>,
    inputs: Mutex<Vec<IndexMap<DotName, Vec<OpId>>>>,
}

impl PlanDef {
    /// Every operator bound in any input set, for ancestor traversal through
    /// unexpanded placeholders.
    pub fn input_ops(&self) -> Vec<OpId> {
        self.inputs
            .lock()
            .unwrap()
            .iter()
            .flat_map(|set| set.values().flatten().copied())
            .collect()
    }
}

/// A parameterized experimental plan in the making.
pub struct Plan {
    workspace: Workspace,
    def: Arc<PlanDef>,
    placeholder: OnceLock<OpId>,
}

impl Plan {
    pub fn new(workspace: &Workspace, factory: Arc<dyn TaskFactory>) -> Self {
        Self {
            workspace: workspace.clone(),
            def: Arc::new(PlanDef {
                factory,
                inputs: Mutex::new(Vec::new()),
            }),
            placeholder: OnceLock::new(),
        }
    }

    /// Add an alternative input set.
    pub fn add(&self, inputs: PlanInputs) {
        self.def.inputs.lock().unwrap().push(inputs.bindings);
    }

    /// A handle to this plan's output stream, usable as an input of other
    /// plans and combinators. All calls return the same placeholder, so every
    /// use shares one expansion.
    pub fn operator(&self) -> OpRef {
        let op = *self.placeholder.get_or_init(|| {
            self.workspace.insert(
                OperatorKind::SubPlan {
                    plan: Arc::clone(&self.def),
                },
                Vec::new(),
            )
        });
        OpRef::new(self.workspace.clone(), op)
    }
}

/// Expand a plan definition into its operator graph, memoized per definition.
///
/// # Errors
///
/// Fails when the plan has no input set, or a name is bound to no operators.
pub(crate) fn build_operator(
    graph: &mut PlanGraph,
    def: &Arc<PlanDef>,
    expanded: &mut HashMap<*const PlanDef, OpId>,
) -> Result<OpId> {
    let key = Arc::as_ptr(def);
    if let Some(&op) = expanded.get(&key) {
        return Ok(op);
    }

    let sets = def.inputs.lock().unwrap().clone();
    if sets.is_empty() {
        return Err(PlanError::EmptyPlan {
            task: def.factory.id().to_string(),
        }
        .into());
    }

    let mut outputs = Vec::with_capacity(sets.len());
    for set in &sets {
        outputs.push(build_task(graph, def, set)?);
    }
    let op = if outputs.len() == 1 {
        outputs[0]
    } else {
        graph.add(OperatorKind::Union { tables: Vec::new() }, outputs)
    };
    debug!(task = def.factory.id(), sets = sets.len(), operator = %op, "built plan operator");
    expanded.insert(key, op);
    Ok(op)
}

/// Build the task operator of one input set.
fn build_task(
    graph: &mut PlanGraph,
    def: &Arc<PlanDef>,
    set: &IndexMap<DotName, Vec<OpId>>,
) -> Result<OpId> {
    // A set with no inputs runs the task exactly once, with no parameters.
    if set.is_empty() {
        let parent = graph.add(
            OperatorKind::Constant {
                documents: vec![Document::Null],
            },
            Vec::new(),
        );
        return Ok(graph.add(
            OperatorKind::Task {
                factory: Arc::clone(&def.factory),
                mappings: Vec::new(),
            },
            vec![parent],
        ));
    }

    // One operator per name; several bindings of a name union together.
    let mut names = Vec::with_capacity(set.len());
    let mut inputs = Vec::with_capacity(set.len());
    for (name, ops) in set {
        if ops.is_empty() {
            return Err(PlanError::EmptyBinding {
                task: def.factory.id().to_string(),
                name: name.clone(),
            }
            .into());
        }
        names.push(name.clone());
        inputs.push(if ops.len() == 1 {
            ops[0]
        } else {
            graph.add(OperatorKind::Union { tables: Vec::new() }, ops.clone())
        });
    }

    let merge = lca_merge(graph, &inputs);
    let mappings = names
        .into_iter()
        .zip(&inputs)
        .map(|(name, op)| (name, merge.map[op]))
        .collect();
    Ok(graph.add(
        OperatorKind::Task {
            factory: Arc::clone(&def.factory),
            mappings,
        },
        vec![merge.operator],
    ))
}

/// Combine input operators into a single stream, joining every pair on its
/// lowest common ancestors. Inputs with no shared ancestry meet in a plain
/// cartesian product. The result maps every input to its node position in
/// the combined output tuple.
pub(crate) fn lca_merge(graph: &mut PlanGraph, inputs: &[OpId]) -> MergeResult {
    let mut opmap = OperatorMap::new();
    for &op in inputs {
        opmap.add(graph, op);
    }

    let mut joins: Vec<OpSet> = (0..inputs.len()).map(|_| OpSet::new()).collect();
    for i in 0..inputs.len() {
        for j in i + 1..inputs.len() {
            for lca in opmap.find_lcas(inputs[i], inputs[j]) {
                joins[i].insert(lca);
                joins[j].insert(lca);
            }
        }
    }

    let mut lattice = Lattice::new();
    for (set, &op) in joins.into_iter().zip(inputs) {
        lattice.add(set, op);
    }
    lattice.merge(graph, &opmap)
}
