use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ring::NodeId;

/// Per-node logical clock tracking the causal history of membership
/// mutations. Zero counters are never stored, so map equality coincides
/// with causal equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock {
    counters: HashMap<NodeId, u64>,
}

impl VectorClock {
    /// Creates an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `node`.
    pub fn tick(&mut self, node: &NodeId) {
        *self.counters.entry(node.clone()).or_insert(0) += 1;
    }

    /// Counter recorded for `node`; zero when absent.
    #[must_use]
    pub fn get(&self, node: &NodeId) -> u64 {
        self.counters.get(node).copied().unwrap_or(0)
    }

    /// Number of nodes with a recorded counter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Returns `true` when no mutation has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Merges `other` into this clock, keeping the pointwise maximum.
    pub fn merge(&mut self, other: &Self) {
        for (node, &counter) in &other.counters {
            if counter == 0 {
                continue;
            }
            let entry = self.counters.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Pointwise maximum of two clocks.
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    /// Causal relationship between two clocks.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrdering {
        let mut less = false;
        let mut greater = false;
        let nodes: HashSet<_> = self
            .counters
            .keys()
            .chain(other.counters.keys())
            .collect();

        for node in nodes {
            let left = self.get(node);
            let right = other.get(node);
            if left < right {
                less = true;
            } else if left > right {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrdering::Equal,
            (true, false) => CausalOrdering::Less,
            (false, true) => CausalOrdering::Greater,
            (true, true) => CausalOrdering::Concurrent,
        }
    }

    /// Returns `true` when the clocks are causally identical.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrdering::Equal
    }
}

/// Relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrdering {
    /// `self` happened-before `other`.
    Less,
    /// Clocks are identical.
    Equal,
    /// `self` happened-after `other`.
    Greater,
    /// Neither clock dominates: the states diverged.
    Concurrent,
}
