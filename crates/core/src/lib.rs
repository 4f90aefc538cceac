//! taskmill core data models.
//!
//! This crate defines the execution entity, its state machine, the failure
//! taxonomy and the retry policy shared by the scheduling crates.

#![warn(missing_docs)]

// Core identities
mod id;

// Execution lifecycle
mod execution;
mod error;
mod event;

// Retry policy
pub mod retry;

pub mod duration_secs;

// Re-exports
pub use id::{ExecutionId, TaskId};

pub use execution::{
    Execution, ExecutionFilter, ExecutionStatus, Priority, StatusChange, TaskSpec,
    TransitionError,
};
pub use error::{ErrorKind, ExecutionError};
pub use event::StatusEvent;
pub use retry::{RetryPolicy, RetryStrategy};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
