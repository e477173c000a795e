//! Logical modification clock.
//!
//! Every local mutation advances the engine's clock, and every remote record
//! carries the clock of the device that wrote it. Comparing the two decides
//! which side of a conflicting edit wins, so the ordering must be total.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A logical clock ordering edits across devices.
///
/// Ordering rules:
/// 1. Higher counter wins
/// 2. If counters are equal, lexicographically higher node_id wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClock {
    /// Identifier of the device or engine instance that produced the tick
    pub node_id: NodeId,
    /// Monotonically increasing counter
    pub counter: u64,
}

impl LogicalClock {
    /// Create a new clock for a node, starting at counter 0.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
        }
    }

    /// Create a clock with a specific counter value.
    pub fn with_counter(node_id: impl Into<NodeId>, counter: u64) -> Self {
        Self {
            node_id: node_id.into(),
            counter,
        }
    }

    /// Advance the clock by one and return the new value.
    pub fn tick(&mut self) -> Self {
        self.counter += 1;
        self.clone()
    }

    /// Fold a remotely observed clock into this one, so the next local tick
    /// orders after everything this engine has seen.
    pub fn observe(&mut self, other: &LogicalClock) {
        self.counter = self.counter.max(other.counter);
    }

    /// Strict causal ordering: true only if this clock is less than `other`.
    pub fn happened_before(&self, other: &LogicalClock) -> bool {
        self < other
    }
}

impl Ord for LogicalClock {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.node_id.cmp(&other.node_id),
            other => other,
        }
    }
}

impl PartialOrd for LogicalClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
