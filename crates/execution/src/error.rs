//! Engine errors.

use taskmill_core::{ExecutionId, TaskId, TransitionError};
use taskmill_storage::StorageError;

/// Errors returned by [`crate::ExecutionEngine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The submission would close a dependency cycle.
    #[error("dependency cycle: {}", .members.join(" -> "))]
    DependencyCycle {
        /// Task ids on the cycle
        members: Vec<String>,
    },

    /// A dependency names nothing known to the engine or the submission.
    #[error("task {task_id} depends on unknown {dependency}")]
    UnknownDependency {
        /// Task declaring the dependency
        task_id: TaskId,
        /// The reference that could not be resolved
        dependency: String,
    },

    /// The same task id appears twice in one graph.
    #[error("duplicate task id {0} in graph")]
    DuplicateTask(TaskId),

    /// No execution with this id.
    #[error("execution {0} not found")]
    NotFound(ExecutionId),

    /// The execution's status does not allow the request.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Store failure on an operation that needs the store.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
