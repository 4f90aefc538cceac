//! Structured failure descriptions recorded on executions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Class of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connectivity or similar transient fault in the operation
    Transient,
    /// Validation or logic fault; retrying will not help
    Permanent,
    /// The circuit breaker rejected the call before it ran
    CircuitOpen,
    /// The engine-side deadline elapsed while running
    Timeout,
    /// The execution was cancelled
    Cancelled,
    /// A dependency ended without completing
    DependencyFailed,
    /// The distributor had no suitable target
    NoTarget,
    /// The engine stopped while the execution was in flight
    Interrupted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::NoTarget => "no_target",
            ErrorKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// A classified failure. `retryable` is fixed by the constructor that built
/// it and is never inferred later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    /// Failure class
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Whether the scheduler may retry after this failure
    pub retryable: bool,
    /// Optional structured payload from the runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ExecutionError {
    fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            details: None,
        }
    }

    /// Retryable operation failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message, true)
    }

    /// Non-retryable operation failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message, false)
    }

    /// Breaker rejection for the named breaker.
    pub fn circuit_open(breaker: &str) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit breaker '{}' is open", breaker),
            true,
        )
    }

    /// Engine-side deadline exceeded.
    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("execution exceeded timeout of {:?}", limit),
            true,
        )
    }

    /// Cancelled by request.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "execution cancelled", false)
    }

    /// A dependency finished without completing.
    pub fn dependency_failed(dependency: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::DependencyFailed,
            format!("dependency {} did not complete", dependency),
            false,
        )
    }

    /// No target offered the required capabilities.
    pub fn no_target(capabilities: &[String]) -> Self {
        Self::new(
            ErrorKind::NoTarget,
            format!("no target available for capabilities {:?}", capabilities),
            true,
        )
    }

    /// In flight when the engine stopped.
    pub fn interrupted() -> Self {
        Self::new(
            ErrorKind::Interrupted,
            "execution was in flight when the engine stopped",
            true,
        )
    }

    /// Attach a structured payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
