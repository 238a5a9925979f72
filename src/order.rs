//! Sort-key orders shared between order-by and join operators.
//!
//! An [`Order`] is a list of tie-break groups over operator ids: within a
//! group the relative order is unconstrained, across groups it is strict.
//! Before use as a concrete sort key the order is flattened into one operator
//! per group; flattening is deterministic because groups preserve insertion
//! order.

use indexmap::IndexSet;

use crate::op_id::OpId;

/// An ordering constraint over upstream operators.
#[derive(Clone, Debug, Default)]
pub struct Order {
    groups: Vec<IndexSet<OpId>>,
}

impl Order {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operator to the last tie-break group, or open a new group.
    pub fn add(&mut self, op: OpId, new_group: bool) {
        if self.groups.is_empty() || new_group {
            self.groups.push(IndexSet::new());
        }
        self.groups
            .last_mut()
            .expect("just pushed a group")
            .insert(op);
    }

    /// Remove the operator from the last group containing it, dropping the
    /// group when it empties.
    pub fn remove(&mut self, op: OpId) {
        for i in (0..self.groups.len()).rev() {
            if self.groups[i].shift_remove(&op) {
                if self.groups[i].is_empty() {
                    self.groups.remove(i);
                }
                break;
            }
        }
    }

    /// Total number of operators across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(IndexSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// A full order compatible with this one: every operator, first group
    /// first, insertion order within each group.
    pub fn items(&self) -> impl Iterator<Item = OpId> + '_ {
        self.groups.iter().flat_map(|g| g.iter().copied())
    }

    /// Replace the groups with one singleton group per item.
    pub fn flatten(&mut self) {
        self.groups = self
            .items()
            .collect::<Vec<_>>()
            .into_iter()
            .map(|op| {
                let mut group = IndexSet::new();
                group.insert(op);
                group
            })
            .collect();
    }

    /// Rewrite every referenced operator through a substitution.
    pub(crate) fn redirect(&mut self, mut resolve: impl FnMut(OpId) -> OpId) {
        self.groups = self
            .groups
            .iter()
            .map(|g| g.iter().map(|&op| resolve(op)).collect())
            .collect();
    }
}
