//! Typed error classes for the two failure families a front end needs to
//! tell apart: plan *structure* problems raised while building or preparing
//! a graph, and task *execution* problems raised while a run is streaming.
//!
//! Both flow through `anyhow::Result` like every other error in the crate;
//! callers that care can `downcast_ref` to [`PlanError`] or [`TaskError`].
//! Graph-invariant violations are not represented here — those are engine
//! bugs and panic with operator context instead.

use thiserror::Error;

use crate::task::DotName;

/// A malformed plan, reported to the plan author with the offending name.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A named input was bound to an empty operator list.
    #[error("input '{name}' of task '{task}' is bound to no operators")]
    EmptyBinding { task: String, name: DotName },

    /// A plan was used as an input or run without any input set.
    #[error("plan for task '{task}' has no input sets")]
    EmptyPlan { task: String },

    /// A dotted name appeared where a simple name is required.
    #[error("name '{name}' should be simple")]
    DottedName { name: DotName },

    /// A `group_by` argument does not feed the grouped operator.
    #[error("group_by argument #{index} is not an ancestor of the grouped operator")]
    NotAnAncestor { index: usize },

    /// A union or product requested over zero operators.
    #[error("{what} needs at least one operator")]
    EmptyCombination { what: &'static str },
}

/// A failure raised by the external task collaborator during iteration.
///
/// Terminates the whole run; there is no partial-result recovery.
#[derive(Debug, Error)]
#[error("task '{task}' failed at operator {operator}")]
pub struct TaskError {
    /// The factory id of the failing task.
    pub task: String,
    /// The operator id, for correlation with graph exports.
    pub operator: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl TaskError {
    pub(crate) fn new(task: impl Into<String>, operator: String, source: anyhow::Error) -> Self {
        Self {
            task: task.into(),
            operator,
            source: source.into(),
        }
    }
}
