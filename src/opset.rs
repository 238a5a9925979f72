//! Growable bit set over small integer ids.
//!
//! Used for two bookkeeping jobs: ancestor-requirement sets in the
//! [`Lattice`](crate::lattice::Lattice) and the triangular reachability index
//! of the [`OperatorMap`](crate::opmap::OperatorMap). Comparison semantics
//! ignore capacity — two sets are equal when they contain the same ids.

use bitvec::prelude::*;

/// A set of small integer ids backed by a bit vector.
#[derive(Clone, Debug, Default)]
pub struct OpSet {
    bits: BitVec,
}

impl OpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from explicit ids.
    pub fn of(ids: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.insert(id);
        }
        set
    }

    pub fn insert(&mut self, id: usize) {
        if id >= self.bits.len() {
            self.bits.resize(id + 1, false);
        }
        self.bits.set(id, true);
    }

    pub fn remove(&mut self, id: usize) {
        if id < self.bits.len() {
            self.bits.set(id, false);
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.bits.get(id).map(|b| *b).unwrap_or(false)
    }

    /// Number of ids in the set.
    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Iterate the ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// `|self ∩ other|` without materializing the intersection.
    pub fn intersection_size(&self, other: &OpSet) -> usize {
        self.iter().filter(|&id| other.contains(id)).count()
    }

    pub fn intersection(&self, other: &OpSet) -> OpSet {
        OpSet::of(self.iter().filter(|&id| other.contains(id)))
    }

    pub fn union_with(&mut self, other: &OpSet) {
        for id in other.iter() {
            self.insert(id);
        }
    }

    /// Remove every id present in `other`.
    pub fn subtract(&mut self, other: &OpSet) {
        for id in other.iter() {
            self.remove(id);
        }
    }

    /// Highest id in the set, if any.
    pub fn max(&self) -> Option<usize> {
        self.bits.last_one()
    }
}

impl PartialEq for OpSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for OpSet {}

impl FromIterator<usize> for OpSet {
    fn from_iter<I: IntoIterator<Item = usize>>(ids: I) -> Self {
        Self::of(ids)
    }
}
