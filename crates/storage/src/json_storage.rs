//! JSON file storage implementation.
//!
//! Stores one JSON file per execution under `<root>/executions/`. Writes go
//! to a temporary file first and are renamed into place, so a crash never
//! leaves a half-written snapshot behind.

use super::{Result, StorageError, TaskStore};
use std::path::{Path, PathBuf};
use taskmill_core::{Execution, ExecutionId};
use tokio::fs;
use tracing::warn;

/// File-based JSON storage backend.
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    /// Create storage, creating the directories it needs.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("executions")).await?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn execution_path(&self, id: ExecutionId) -> PathBuf {
        self.root.join("executions").join(format!("{}.json", id))
    }
}

#[async_trait::async_trait]
impl TaskStore for JsonStore {
    async fn persist(&self, execution: &Execution) -> Result<()> {
        let path = self.execution_path(execution.execution_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(execution)?;
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, id: ExecutionId) -> Result<Option<Execution>> {
        read_json(&self.execution_path(id)).await
    }

    async fn load_all(&self) -> Result<Vec<Execution>> {
        let mut all: Vec<Execution> = list_dir(&self.root.join("executions")).await?;
        all.sort_by_key(|e| e.created_at);
        Ok(all)
    }

    async fn remove(&self, id: ExecutionId) -> Result<()> {
        match fs::remove_file(self.execution_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!(path = %entry.path().display(), "skipping unreadable snapshot: {}", e),
        }
    }
    Ok(items)
}
