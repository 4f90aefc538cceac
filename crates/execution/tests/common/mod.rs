//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskmill_core::{Execution, ExecutionError, ExecutionId};
use taskmill_execution::{EngineConfig, ExecutionEngine, RunContext, RunnerError, WorkflowRunner};
use taskmill_resilience::CircuitBreakerRegistry;

/// What the runner does on one call for a task.
pub enum Step {
    Succeed,
    Fail(ExecutionError),
    Unclassified(&'static str),
    Sleep(Duration),
    Hang,
    HangUntilCancelled,
}

/// Runner that follows a per-task script and succeeds once the script runs
/// out.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    started: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, task: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into());
    }

    /// Task ids in the order their calls started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn calls(&self, task: &str) -> usize {
        self.started().iter().filter(|t| *t == task).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowRunner for ScriptedRunner {
    async fn invoke(
        &self,
        _workflow_type: &str,
        _parameters: &Map<String, Value>,
        ctx: RunContext,
    ) -> Result<Value, RunnerError> {
        let task = ctx.task_id.to_string();
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed);
        self.started.lock().unwrap().push(task.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let result = match step {
            Step::Succeed => Ok(json!({"task": task, "attempt": ctx.attempt})),
            Step::Fail(error) => Err(error.into()),
            Step::Unclassified(message) => Err(anyhow::anyhow!(message).into()),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({"task": task, "slept": duration.as_secs_f64()}))
            }
            Step::Hang => std::future::pending().await,
            Step::HangUntilCancelled => {
                ctx.cancel.cancelled().await;
                Err(ExecutionError::cancelled().into())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn config() -> EngineConfig {
    EngineConfig::default()
        .with_tick_interval(Duration::from_millis(100))
        .with_retry_jitter(0.0)
}

pub fn engine(config: EngineConfig, runner: Arc<ScriptedRunner>) -> ExecutionEngine {
    ExecutionEngine::new(config, runner, Arc::new(CircuitBreakerRegistry::new())).unwrap()
}

/// Poll until `pred` holds, letting paused time advance between polls.
pub async fn wait_until<F>(engine: &ExecutionEngine, id: ExecutionId, pred: F) -> Execution
where
    F: Fn(&Execution) -> bool,
{
    for _ in 0..20_000 {
        let execution = engine.get_execution(id).await.unwrap();
        if pred(&execution) {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("execution {} never reached the expected state", id);
}

pub async fn wait_final(engine: &ExecutionEngine, id: ExecutionId) -> Execution {
    wait_until(engine, id, |e| e.is_terminal()).await
}
