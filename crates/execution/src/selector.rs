//! Dispatch ordering strategies.

use taskmill_core::{ExecutionId, Priority};

/// An execution eligible for dispatch on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Execution to dispatch
    pub execution_id: ExecutionId,
    /// Its priority
    pub priority: Priority,
    /// Submission sequence number, lower was submitted earlier
    pub seq: u64,
}

/// Strategy for ordering the executions that compete for free slots.
pub trait ExecutionSelector: Send + Sync {
    /// Sort `candidates` in dispatch order, first to run first.
    fn order(&self, candidates: &mut [Candidate]);
}

/// Default selector: priority descending, then submission order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrioritySelector;

impl PrioritySelector {
    /// Create a new priority selector.
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionSelector for PrioritySelector {
    fn order(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.seq.cmp(&b.seq)));
    }
}
