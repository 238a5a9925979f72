//! # expflow
//!
//! A dataflow engine for **parameterized experimental plans**: describe a
//! pipeline of computational tasks as a graph of named inputs, cartesian
//! combinations, joins on shared ancestors, grouping and ordering, and let
//! the engine compile it into a minimal tree of join/product operators that
//! streams parameter tuples into task invocations.
//!
//! ## Quick start
//!
//! ```
//! use expflow::{RunContext, Workspace};
//! use serde_json::json;
//!
//! fn main() -> anyhow::Result<()> {
//!     let ws = Workspace::new();
//!
//!     // Two independent parameter axes.
//!     let lr = ws.constant("lr", vec![json!(0.1), json!(0.01)]);
//!     let depth = ws.constant("depth", vec![json!(2), json!(4)]);
//!
//!     // Their combination: a 2x2 grid, one JSON object per point.
//!     let grid = ws.merge("grid", &[("lr", &lr), ("depth", &depth)])?;
//!
//!     let results = grid.run(&RunContext::new())?;
//!     assert_eq!(results.len(), 4);
//!     assert_eq!(results[0], json!({"depth": 2, "lr": 0.1}));
//!     Ok(())
//! }
//! ```
//!
//! ## Concepts
//!
//! - **Operators** form an append-only DAG in a [`Workspace`]; handles
//!   ([`OpRef`]) stay cheap to clone and combine. Running a handle snapshots
//!   the graph, expands nested plans, simplifies degenerate nodes, runs the
//!   needed-streams initialization and drains a pull-based iterator.
//! - **Provenance contexts.** Every tuple carries one 64-bit id per tracked
//!   upstream stream. Joins compare them, `group_by` watches them for
//!   boundaries, sorts order by them. That is how two streams derived from
//!   one shared ancestor recombine point-for-point instead of crossing.
//! - **Join minimization.** A [`Plan`] binds task parameters to operators;
//!   pairwise lowest common ancestors feed a lattice of requirement sets
//!   that contracts into the smallest equivalent join/product tree.
//! - **Tasks** are external collaborators behind [`TaskFactory`]; the engine
//!   invokes each task at most once per distinct upstream tuple within one
//!   [`RunContext`], however many consumers its output fans out to.

pub mod context;
pub mod error;
pub mod graph;
pub mod op_id;
pub mod opmap;
pub mod opref;
pub mod opset;
pub mod order;
pub mod plan;
pub mod task;
pub mod testing;
pub mod value;

mod dot;
mod exec;
mod lattice;
mod operator;
mod planner;

pub use context::RunContext;
pub use error::{PlanError, TaskError};
pub use graph::Workspace;
pub use op_id::OpId;
pub use opmap::OperatorMap;
pub use opref::OpRef;
pub use opset::OpSet;
pub use order::Order;
pub use plan::{Plan, PlanInputs};
pub use task::{DotName, Task, TaskFactory};
pub use value::{Document, Tuple};
