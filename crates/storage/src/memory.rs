//! In-memory store.

use super::{Result, StorageError, TaskStore};
use std::collections::HashMap;
use taskmill_core::{Execution, ExecutionId};
use tokio::sync::Mutex;

/// Keeps snapshots in a map. Useful for tests and single-process use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: Mutex<HashMap<ExecutionId, Execution>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.executions.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.executions.lock().await.is_empty()
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryStore {
    async fn persist(&self, execution: &Execution) -> Result<()> {
        self.executions
            .lock()
            .await
            .insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn load(&self, id: ExecutionId) -> Result<Option<Execution>> {
        Ok(self.executions.lock().await.get(&id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<Execution>> {
        let mut all: Vec<_> = self.executions.lock().await.values().cloned().collect();
        all.sort_by_key(|e| e.created_at);
        Ok(all)
    }

    async fn remove(&self, id: ExecutionId) -> Result<()> {
        self.executions
            .lock()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}
