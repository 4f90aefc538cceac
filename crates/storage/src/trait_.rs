//! Task store trait abstraction.

use async_trait::async_trait;
use taskmill_core::{Execution, ExecutionId};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend temporarily unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Snapshot store for executions.
///
/// This trait allows different storage backends to be plugged in. The engine
/// calls `persist` after every transition and tolerates any error it returns.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Save the latest snapshot of an execution (create or replace).
    async fn persist(&self, execution: &Execution) -> Result<()>;

    /// Load one snapshot.
    async fn load(&self, id: ExecutionId) -> Result<Option<Execution>>;

    /// Load every snapshot.
    async fn load_all(&self) -> Result<Vec<Execution>>;

    /// Delete a snapshot.
    async fn remove(&self, id: ExecutionId) -> Result<()>;
}
