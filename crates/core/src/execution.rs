//! Execution model - one scheduled unit of work and its retries.

use crate::error::ExecutionError;
use crate::id::{ExecutionId, TaskId};
use crate::retry::{RetryPolicy, RetryStrategy};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Scheduling priority. Higher runs first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Lifecycle status of an execution.
///
/// ```text
/// PENDING → SCHEDULED → PREPARING → RUNNING → COMPLETED | FAILED | TIMEOUT
/// FAILED | TIMEOUT → RETRYING → SCHEDULED
/// RUNNING ⇄ PAUSED
/// any non-terminal → CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Waiting for dependencies or its scheduled time
    Pending,
    /// Eligible, waiting for a concurrency slot
    Scheduled,
    /// Holding a slot, passing the breaker and distributor gates
    Preparing,
    /// Workflow runner invoked
    Running,
    /// Suspended by an external signal
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Exceeded its running deadline
    Timeout,
    /// Between a failure and its next scheduled attempt
    Retrying,
    /// Cancelled by request
    Cancelled,
}

impl ExecutionStatus {
    /// All statuses, in declaration order.
    pub const ALL: [ExecutionStatus; 10] = [
        Self::Pending,
        Self::Scheduled,
        Self::Preparing,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Timeout,
        Self::Retrying,
        Self::Cancelled,
    ];

    /// Whether no further transition (other than a retry decided in the
    /// same step) can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Whether an execution in this status holds a concurrency slot.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Preparing | Self::Running | Self::Paused)
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        if to == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Pending, Failed)
                | (Scheduled, Preparing)
                | (Preparing, Running)
                | (Preparing, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
                | (Failed, Retrying)
                | (Timeout, Retrying)
                | (Retrying, Scheduled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Preparing => "PREPARING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Retrying => "RETRYING",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    /// Status before the attempted transition
    pub from: ExecutionStatus,
    /// Requested status
    pub to: ExecutionStatus,
}

/// One entry of the append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Status entered
    pub status: ExecutionStatus,
    /// Status left (`None` for the initial entry)
    pub previous: Option<ExecutionStatus>,
    /// When the change was applied
    pub timestamp: Time,
}

/// Submission descriptor for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-owned task identifier
    pub task_id: TaskId,

    /// Kind of operation the workflow runner should perform
    pub workflow_type: String,

    #[serde(default)]
    pub priority: Priority,

    /// Opaque parameters forwarded to the runner
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub retry_strategy: RetryStrategy,

    #[serde(default)]
    pub max_retries: u32,

    /// Base retry delay
    #[serde(default = "default_retry_delay", with = "crate::duration_secs")]
    pub retry_delay: Duration,

    /// Running deadline; engine default when absent
    #[serde(default, with = "crate::duration_secs::option")]
    pub timeout: Option<Duration>,

    /// Existing executions that must complete first
    #[serde(default)]
    pub dependencies: Vec<ExecutionId>,

    /// Earliest start; immediately when absent
    #[serde(default)]
    pub scheduled_time: Option<Time>,

    /// Capabilities the distributor must satisfy
    #[serde(default)]
    pub required_capabilities: Vec<String>,

    /// Circuit breaker name; defaults to `workflow_type`
    #[serde(default)]
    pub breaker: Option<String>,
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl TaskSpec {
    /// Create a spec with default scheduling hints.
    pub fn new(task_id: impl Into<TaskId>, workflow_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_type: workflow_type.into(),
            priority: Priority::default(),
            parameters: serde_json::Map::new(),
            retry_strategy: RetryStrategy::None,
            max_retries: 0,
            retry_delay: default_retry_delay(),
            timeout: None,
            dependencies: Vec::new(),
            scheduled_time: None,
            required_capabilities: Vec::new(),
            breaker: None,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a runner parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Set the retry strategy, limit and base delay.
    pub fn with_retry(mut self, strategy: RetryStrategy, max_retries: u32, delay: Duration) -> Self {
        self.retry_strategy = strategy;
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    /// Set the running deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Depend on an existing execution.
    pub fn depends_on(mut self, execution_id: ExecutionId) -> Self {
        self.dependencies.push(execution_id);
        self
    }

    /// Defer the first attempt.
    pub fn not_before(mut self, at: Time) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    /// Require a distributor capability.
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Route through a specific circuit breaker.
    pub fn with_breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker = Some(name.into());
        self
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Engine-generated identifier
    pub execution_id: ExecutionId,

    /// Caller-owned task identifier
    pub task_id: TaskId,

    pub workflow_type: String,

    pub priority: Priority,

    pub parameters: serde_json::Map<String, serde_json::Value>,

    pub retry_strategy: RetryStrategy,

    pub max_retries: u32,

    #[serde(with = "crate::duration_secs")]
    pub retry_delay: Duration,

    /// Retries consumed so far
    pub retry_count: u32,

    /// Executions that must be COMPLETED before this one starts
    pub dependencies: BTreeSet<ExecutionId>,

    /// Maximum time permitted in RUNNING
    #[serde(with = "crate::duration_secs")]
    pub timeout: Duration,

    /// Earliest instant the engine may start this execution
    pub scheduled_time: Time,

    pub required_capabilities: Vec<String>,

    /// Target chosen by the distributor for the current attempt
    pub target: Option<String>,

    /// Circuit breaker guarding the runner call
    pub breaker: String,

    pub status: ExecutionStatus,

    /// Append-only transition log
    pub status_history: Vec<StatusChange>,

    /// Success payload
    pub result: Option<serde_json::Value>,

    /// Failure description
    pub error: Option<ExecutionError>,

    pub created_at: Time,

    pub updated_at: Time,
}

impl Execution {
    /// Build a PENDING execution from a submission.
    pub fn from_spec(
        execution_id: ExecutionId,
        spec: TaskSpec,
        default_timeout: Duration,
        now: Time,
    ) -> Self {
        let breaker = spec.breaker.unwrap_or_else(|| spec.workflow_type.clone());
        Self {
            execution_id,
            task_id: spec.task_id,
            workflow_type: spec.workflow_type,
            priority: spec.priority,
            parameters: spec.parameters,
            retry_strategy: spec.retry_strategy,
            max_retries: spec.max_retries,
            retry_delay: spec.retry_delay,
            retry_count: 0,
            dependencies: spec.dependencies.into_iter().collect(),
            timeout: spec.timeout.unwrap_or(default_timeout),
            scheduled_time: spec.scheduled_time.unwrap_or(now),
            required_capabilities: spec.required_capabilities,
            target: None,
            breaker,
            status: ExecutionStatus::Pending,
            status_history: vec![StatusChange {
                status: ExecutionStatus::Pending,
                previous: None,
                timestamp: now,
            }],
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition and append it to the history.
    pub fn transition(&mut self, to: ExecutionStatus, at: Time) -> Result<(), TransitionError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }

        self.status = to;
        self.updated_at = at;
        self.status_history.push(StatusChange {
            status: to,
            previous: Some(from),
            timestamp: at,
        });
        Ok(())
    }

    /// Record a success payload, clearing any earlier error.
    pub fn set_result(&mut self, result: serde_json::Value) {
        self.result = Some(result);
        self.error = None;
    }

    /// Record a failure, clearing any earlier result.
    pub fn set_error(&mut self, error: ExecutionError) {
        self.error = Some(error);
        self.result = None;
    }

    /// Whether the execution has finished for good.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Retry policy for this execution under engine-wide limits.
    pub fn retry_policy(&self, max_delay: Duration, jitter: f64) -> RetryPolicy {
        RetryPolicy {
            strategy: self.retry_strategy,
            max_retries: self.max_retries,
            base_delay: self.retry_delay,
            max_delay,
            jitter,
        }
    }

    /// Statuses visited, in order.
    pub fn status_path(&self) -> Vec<ExecutionStatus> {
        self.status_history.iter().map(|c| c.status).collect()
    }
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    /// Filter by status
    pub status: Option<Vec<ExecutionStatus>>,

    /// Filter by minimum priority
    pub min_priority: Option<Priority>,

    /// Filter by task
    pub task_id: Option<TaskId>,

    /// Filter by workflow type
    pub workflow_type: Option<String>,

    /// Maximum results to return
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    /// Whether an execution passes every set criterion.
    pub fn matches(&self, execution: &Execution) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&execution.status) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if execution.priority < min {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if &execution.task_id != task_id {
                return false;
            }
        }
        if let Some(workflow_type) = &self.workflow_type {
            if &execution.workflow_type != workflow_type {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pending() -> Execution {
        Execution::from_spec(
            ExecutionId::new(),
            TaskSpec::new("t1", "build"),
            Duration::from_secs(60),
            Utc::now(),
        )
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn test_from_spec_defaults() {
        let exec = pending();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.breaker, "build");
        assert_eq!(exec.timeout, Duration::from_secs(60));
        assert_eq!(exec.retry_count, 0);
        assert_eq!(exec.status_history.len(), 1);
        assert_eq!(exec.status_history[0].previous, None);
        assert!(exec.result.is_none() && exec.error.is_none());
    }

    #[test]
    fn test_happy_path_transitions_append_history() {
        let mut exec = pending();
        let now = Utc::now();
        for to in [
            ExecutionStatus::Scheduled,
            ExecutionStatus::Preparing,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
        ] {
            exec.transition(to, now).unwrap();
        }

        assert_eq!(
            exec.status_path(),
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::Scheduled,
                ExecutionStatus::Preparing,
                ExecutionStatus::Running,
                ExecutionStatus::Completed,
            ]
        );
        assert_eq!(
            exec.status_history[4].previous,
            Some(ExecutionStatus::Running)
        );
    }

    #[test]
    fn test_invalid_transition_leaves_state_untouched() {
        let mut exec = pending();
        let err = exec
            .transition(ExecutionStatus::Running, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, ExecutionStatus::Pending);
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.status_history.len(), 1);
    }

    #[test]
    fn test_cancellation_only_from_non_terminal() {
        for status in ExecutionStatus::ALL {
            assert_eq!(
                status.can_transition_to(ExecutionStatus::Cancelled),
                !status.is_terminal(),
                "{}",
                status
            );
        }
    }

    #[test]
    fn test_retry_loop_transitions() {
        use ExecutionStatus::*;
        assert!(Failed.can_transition_to(Retrying));
        assert!(Timeout.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Scheduled));
        assert!(!Completed.can_transition_to(Retrying));
        assert!(!Retrying.can_transition_to(Running));
    }

    #[test]
    fn test_pause_only_from_running() {
        use ExecutionStatus::*;
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Scheduled.can_transition_to(Paused));
    }

    #[test]
    fn test_result_and_error_are_exclusive() {
        let mut exec = pending();
        exec.set_error(ExecutionError::transient("boom"));
        exec.set_result(serde_json::json!({"ok": true}));
        assert!(exec.error.is_none());
        exec.set_error(ExecutionError::permanent("bad"));
        assert!(exec.result.is_none());
    }

    #[test]
    fn test_filter_matching() {
        let mut exec = pending();
        exec.priority = Priority::High;

        assert!(ExecutionFilter::default().matches(&exec));
        assert!(ExecutionFilter {
            status: Some(vec![ExecutionStatus::Pending]),
            min_priority: Some(Priority::Medium),
            ..Default::default()
        }
        .matches(&exec));
        assert!(!ExecutionFilter {
            min_priority: Some(Priority::Critical),
            ..Default::default()
        }
        .matches(&exec));
        assert!(!ExecutionFilter {
            workflow_type: Some("deploy".into()),
            ..Default::default()
        }
        .matches(&exec));
    }

    #[test]
    fn test_spec_deserializes_with_seconds() {
        let spec: TaskSpec = serde_json::from_value(serde_json::json!({
            "task_id": "lint",
            "workflow_type": "command",
            "retry_strategy": "FixedDelay",
            "max_retries": 2,
            "retry_delay": 2.5,
            "timeout": 5
        }))
        .unwrap();

        assert_eq!(spec.retry_delay, Duration::from_millis(2500));
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
        assert_eq!(spec.priority, Priority::Medium);
    }
}
