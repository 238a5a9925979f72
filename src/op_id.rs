//! Lightweight unique identifier for operators within a
//! [`Workspace`](crate::graph::Workspace).
//!
//! Each operator record inserted into the plan graph is assigned a sequential
//! `OpId`. These are opaque handles—only the planner, the lattice and the
//! executor inspect them directly.
//!
//! They’re small, `Copy`, and hashable, so they can be used efficiently as keys
//! in maps, bitsets and redirect tables when rewriting or traversing the plan.

use std::fmt;

/// Unique numeric identifier for an operator in a plan graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct OpId(u32);

impl OpId {
    /// Create a new `OpId` (used internally by the graph arena).
    pub(crate) fn new(v: usize) -> Self {
        debug_assert!(v <= u32::MAX as usize, "operator arena overflow");
        Self(v as u32)
    }

    /// Return the underlying numeric value.
    ///
    /// Useful mainly for debugging or graph exports.
    pub fn raw(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
