//! Workflow runner that executes local commands.
//!
//! Handles the `command` workflow type. Parameters:
//! `program` (required), `args` (array of strings), `cwd` (directory).

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::io;
use std::path::PathBuf;
use taskmill_core::ExecutionError;
use taskmill_execution::{RunContext, RunnerError, WorkflowRunner};
use tokio::process::Command;
use tracing::debug;

/// Runs each execution as a child process.
pub struct CommandRunner {
    workdir: Option<PathBuf>,
}

impl CommandRunner {
    /// Create a runner; commands without a `cwd` run in `workdir`.
    pub fn new(workdir: Option<PathBuf>) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl WorkflowRunner for CommandRunner {
    async fn invoke(
        &self,
        workflow_type: &str,
        parameters: &Map<String, Value>,
        ctx: RunContext,
    ) -> Result<Value, RunnerError> {
        if workflow_type != "command" {
            return Err(ExecutionError::permanent(format!(
                "unsupported workflow type '{}'",
                workflow_type
            ))
            .into());
        }

        let program = parameters
            .get("program")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::permanent("missing 'program' parameter"))?;
        let args: Vec<String> = match parameters.get("args") {
            Some(args) => serde_json::from_value(args.clone())
                .map_err(|e| ExecutionError::permanent(format!("invalid 'args': {}", e)))?,
            None => Vec::new(),
        };

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .env("TASKMILL_EXECUTION_ID", ctx.execution_id.to_string())
            .env("TASKMILL_TASK_ID", ctx.task_id.as_str())
            .env("TASKMILL_ATTEMPT", ctx.attempt.to_string())
            .kill_on_drop(true);
        if let Some(target) = &ctx.target {
            cmd.env("TASKMILL_TARGET", target);
        }
        let cwd = parameters
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .or_else(|| self.workdir.clone());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(task_id = %ctx.task_id, program, ?args, "spawning command");

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ExecutionError::cancelled().into());
            }
            output = cmd.output() => {
                output.with_context(|| format!("failed to run {}", program))?
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(json!({
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }))
        } else {
            Err(ExecutionError::transient(format!("{} exited with {}", program, exit_code))
                .with_details(json!({
                    "exit_code": exit_code,
                    "stderr": stderr,
                }))
                .into())
        }
    }

    fn classify(&self, error: &anyhow::Error) -> ExecutionError {
        match error.downcast_ref::<io::Error>().map(io::Error::kind) {
            Some(io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) | None => {
                ExecutionError::permanent(format!("{:#}", error))
            }
            Some(_) => ExecutionError::transient(format!("{:#}", error)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use taskmill_core::{ErrorKind, ExecutionId, TaskId};

    fn ctx() -> RunContext {
        RunContext {
            execution_id: ExecutionId::new(),
            task_id: TaskId::from("t"),
            attempt: 0,
            target: None,
            cancel: Default::default(),
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_successful_command_captures_output() {
        let runner = CommandRunner::new(None);
        let result = runner
            .invoke(
                "command",
                &params(json!({"program": "echo", "args": ["hello"]})),
                ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transient() {
        let runner = CommandRunner::new(None);
        let err = runner
            .invoke("command", &params(json!({"program": "false"})), ctx())
            .await
            .unwrap_err();

        let RunnerError::Classified(err) = err else {
            panic!("expected a classified error");
        };
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(err.details.unwrap()["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let runner = CommandRunner::new(None);
        let err = runner
            .invoke(
                "command",
                &params(json!({"program": "taskmill-no-such-binary"})),
                ctx(),
            )
            .await
            .unwrap_err();

        let RunnerError::Unclassified(err) = err else {
            panic!("expected an unclassified error");
        };
        assert_eq!(runner.classify(&err).kind, ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_bad_parameters_are_permanent() {
        let runner = CommandRunner::new(None);
        for (workflow, parameters) in [
            ("docker", json!({"program": "echo"})),
            ("command", json!({})),
            ("command", json!({"program": "echo", "args": "not-a-list"})),
        ] {
            let err = runner
                .invoke(workflow, &params(parameters), ctx())
                .await
                .unwrap_err();
            assert!(matches!(err, RunnerError::Classified(ref e) if !e.retryable));
        }
    }
}
