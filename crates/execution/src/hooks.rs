//! Lifecycle hooks.
//!
//! Hooks are registered before the engine starts and run in registration
//! order. A failing hook is logged and skipped; it never changes the state
//! of the execution it observed.

use serde_json::Value;
use std::sync::Arc;
use taskmill_core::{Execution, ExecutionError};
use tracing::warn;

/// Point in the lifecycle a hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// Execution entered RUNNING, runner about to be invoked
    PreExecution,
    /// Execution reached COMPLETED, FAILED, TIMEOUT or CANCELLED
    PostExecution,
    /// A runner result arrived for an execution that no longer expects it
    Orphaned,
}

/// What a hook is shown.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// Stage being observed
    pub stage: HookStage,
    /// Execution snapshot at that stage
    pub execution: &'a Execution,
    /// The discarded runner outcome, for orphaned results
    pub outcome: Option<&'a Result<Value, ExecutionError>>,
}

/// A lifecycle hook.
pub type Hook = Arc<dyn Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Ordered hook lists, one per stage.
#[derive(Clone, Default)]
pub struct Hooks {
    pre_execution: Vec<Hook>,
    post_execution: Vec<Hook>,
    orphaned: Vec<Hook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_execution", &self.pre_execution.len())
            .field("post_execution", &self.post_execution.len())
            .field("orphaned", &self.orphaned.len())
            .finish()
    }
}

impl Hooks {
    /// No hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook for `stage`.
    pub fn register(&mut self, stage: HookStage, hook: Hook) {
        self.list_mut(stage).push(hook);
    }

    /// Hooks registered for `stage`.
    pub fn len(&self, stage: HookStage) -> usize {
        self.list(stage).len()
    }

    fn list(&self, stage: HookStage) -> &[Hook] {
        match stage {
            HookStage::PreExecution => &self.pre_execution,
            HookStage::PostExecution => &self.post_execution,
            HookStage::Orphaned => &self.orphaned,
        }
    }

    fn list_mut(&mut self, stage: HookStage) -> &mut Vec<Hook> {
        match stage {
            HookStage::PreExecution => &mut self.pre_execution,
            HookStage::PostExecution => &mut self.post_execution,
            HookStage::Orphaned => &mut self.orphaned,
        }
    }

    /// Run every hook for `ctx.stage`. Returns how many failed.
    pub fn run(&self, ctx: &HookContext<'_>) -> usize {
        let mut failed = 0;
        for (index, hook) in self.list(ctx.stage).iter().enumerate() {
            if let Err(e) = hook(ctx) {
                failed += 1;
                warn!(
                    execution_id = %ctx.execution.execution_id,
                    stage = ?ctx.stage,
                    hook = index,
                    "hook failed: {:#}",
                    e
                );
            }
        }
        failed
    }
}
