//! Execution context of a single run.
//!
//! A [`RunContext`] carries everything iteration needs besides the graph
//! itself: the simulation switch, optional per-operator output counters and
//! the cache replayed sequences of cacheable operators are stored in. It is
//! deliberately single-threaded; a run owns its context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::op_id::OpId;
use crate::value::Tuple;

/// Fully materialized output of a cacheable operator, replayed on every
/// later request within the same run.
pub(crate) struct CachedRun {
    pub tuples: Vec<Tuple>,
    pub failed: Option<CachedFailure>,
}

/// A failure observed while filling a cache; replays rebuild the error so
/// every consumer sees the same outcome.
#[derive(Clone)]
pub(crate) struct CachedFailure {
    pub task: String,
    pub operator: String,
    pub detail: String,
}

pub struct RunContext {
    simulate: bool,
    counters: Option<RefCell<HashMap<OpId, u64>>>,
    caches: RefCell<HashMap<OpId, Rc<CachedRun>>>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            simulate: false,
            counters: None,
            caches: RefCell::new(HashMap::new()),
        }
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable per-operator output counting.
    #[must_use]
    pub fn counting(mut self, flag: bool) -> Self {
        self.counters = flag.then(|| RefCell::new(HashMap::new()));
        self
    }

    /// Run tasks in simulation mode: tasks are asked not to produce side
    /// effects, everything else behaves normally.
    #[must_use]
    pub fn simulating(mut self, flag: bool) -> Self {
        self.simulate = flag;
        self
    }

    pub fn simulate(&self) -> bool {
        self.simulate
    }

    /// Snapshot of the output counters, when counting is enabled. Counts
    /// accumulate over every iterator created from this context.
    pub fn counts(&self) -> Option<HashMap<OpId, u64>> {
        self.counters.as_ref().map(|c| c.borrow().clone())
    }

    pub(crate) fn bump(&self, op: OpId) {
        if let Some(counters) = &self.counters {
            *counters.borrow_mut().entry(op).or_insert(0) += 1;
        }
    }

    /// A sibling context for a logically separate run: same configuration,
    /// fresh counters and caches.
    #[must_use]
    pub fn fork(&self) -> RunContext {
        RunContext {
            simulate: self.simulate,
            counters: self.counters.as_ref().map(|_| RefCell::new(HashMap::new())),
            caches: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn cached(&self, op: OpId) -> Option<Rc<CachedRun>> {
        self.caches.borrow().get(&op).map(Rc::clone)
    }

    pub(crate) fn store_cache(&self, op: OpId, run: Rc<CachedRun>) {
        self.caches.borrow_mut().insert(op, run);
    }
}
