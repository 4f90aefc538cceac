//! Contracts for the collaborators that perform the actual work.

use async_trait::async_trait;
use serde_json::{Map, Value};
use taskmill_core::{ExecutionError, ExecutionId, TaskId};
use tokio_util::sync::CancellationToken;

/// Failure returned by a [`WorkflowRunner`].
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The runner already classified the failure.
    #[error(transparent)]
    Classified(#[from] ExecutionError),

    /// Anything else. Passed through [`WorkflowRunner::classify`] once.
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

/// What a runner learns about the attempt it is asked to perform.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Execution being run
    pub execution_id: ExecutionId,
    /// Task it belongs to
    pub task_id: TaskId,
    /// Retries consumed before this attempt
    pub attempt: u32,
    /// Target chosen by the distributor, if any
    pub target: Option<String>,
    /// Cancelled when the execution is cancelled, times out, or the engine
    /// shuts down
    pub cancel: CancellationToken,
}

/// Performs a workflow. The engine never interprets `workflow_type` or the
/// parameters.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Run `workflow_type` with `parameters`.
    async fn invoke(
        &self,
        workflow_type: &str,
        parameters: &Map<String, Value>,
        ctx: RunContext,
    ) -> Result<Value, RunnerError>;

    /// Classify an error the runner did not classify itself. The default
    /// treats it as permanent.
    fn classify(&self, error: &anyhow::Error) -> ExecutionError {
        ExecutionError::permanent(format!("{:#}", error))
    }
}

/// Chooses where an execution runs.
#[async_trait]
pub trait Distributor: Send + Sync {
    /// A target offering every capability in `required`, or `None`.
    async fn select_target(&self, required: &[String]) -> Option<String>;
}
