//! Status events - what the engine tells the outside world.

use crate::execution::{Execution, ExecutionStatus};
use crate::id::{ExecutionId, TaskId};
use crate::Time;
use serde::{Deserialize, Serialize};

/// A status transition applied to an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Execution that changed
    pub execution_id: ExecutionId,

    /// Task it belongs to
    pub task_id: TaskId,

    /// Status entered
    pub status: ExecutionStatus,

    /// Status left
    pub previous: Option<ExecutionStatus>,

    /// Retries consumed at the time of the change
    pub retry_count: u32,

    /// When it happened
    pub timestamp: Time,
}

impl StatusEvent {
    /// Event for the latest history entry of `execution`.
    pub fn latest(execution: &Execution) -> Option<Self> {
        execution.status_history.last().map(|change| Self {
            execution_id: execution.execution_id,
            task_id: execution.task_id.clone(),
            status: change.status,
            previous: change.previous,
            retry_count: execution.retry_count,
            timestamp: change.timestamp,
        })
    }
}
