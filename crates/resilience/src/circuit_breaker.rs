//! Per-resource circuit breaker.
//!
//! ```text
//! CLOSED --failure_threshold failures--> OPEN
//! OPEN --reset_timeout elapsed, admit()--> HALF_OPEN
//! HALF_OPEN --success--> CLOSED
//! HALF_OPEN --failure--> OPEN
//! ```
//!
//! Callers bracket exactly one operation: `admit()` first, then exactly one
//! of `record_success()` / `record_failure()`. A rejected `admit()` means the
//! operation must not run.
//!
//! Callers that may lose track of an operation use [`CircuitBreaker::try_admit`]
//! instead. The returned [`Admission`] is settled with
//! [`CircuitBreaker::settle`], or handed back unjudged with
//! [`CircuitBreaker::release`]. Outcomes of calls admitted before the last
//! state change only update counters.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally
    #[default]
    Closed,
    /// Calls are rejected until the reset timeout elapses
    Open,
    /// A limited number of trial calls are admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// How long the circuit stays open after the last failure
    #[serde(with = "taskmill_core::duration_secs")]
    pub reset_timeout: Duration,

    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the half-open call limit.
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Successful calls recorded
    pub success_count: u64,
    /// Current consecutive failure streak
    pub failure_count: u32,
    /// Failures recorded over the breaker's lifetime
    pub total_failures: u64,
    /// Calls rejected by `admit()`
    pub rejected_count: u64,
    /// Number of state changes
    pub state_changes: u64,
    /// Trial calls currently admitted while half-open
    pub half_open_calls_in_flight: u32,
}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker refused the call; the operation did not run
    #[error("circuit breaker '{breaker}' rejected the call")]
    Rejected {
        /// Breaker name
        breaker: String,
    },

    /// The operation ran and failed
    #[error("operation failed: {0}")]
    Failed(E),
}

/// Ticket for one admitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    generation: u64,
    state: CircuitState,
}

impl Admission {
    /// State the breaker was in when the call was admitted.
    pub fn state(&self) -> CircuitState {
        self.state
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every state change
    generation: u64,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
    success_count: u64,
    total_failures: u64,
    rejected_count: u64,
    state_changes: u64,
}

/// Failure isolator for one named resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.state_changes += 1;
        inner.generation += 1;
        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, "circuit opened"),
            _ => info!(breaker = %self.name, %from, %to, "circuit state changed"),
        }
    }

    fn reset_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.reset_timeout)
    }

    /// Ask permission to run one operation.
    pub fn admit(&self) -> bool {
        self.try_admit().is_some()
    }

    /// Ask permission to run one operation, returning a ticket for it.
    pub fn try_admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.reset_elapsed(&inner) {
                    self.set_state(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !admitted {
            inner.rejected_count += 1;
            return None;
        }
        Some(Admission {
            generation: inner.generation,
            state: inner.state,
        })
    }

    /// Record the outcome of the call `admission` was issued for. A call
    /// admitted before the last state change only counts; it cannot move
    /// the breaker.
    pub fn settle(&self, admission: Admission, success: bool) {
        let mut inner = self.lock();
        match (admission.generation == inner.generation, success) {
            (true, true) => self.on_success(&mut inner),
            (true, false) => self.on_failure(&mut inner),
            (false, true) => inner.success_count += 1,
            (false, false) => inner.total_failures += 1,
        }
    }

    /// Give back an admitted call without judging it. Frees its half-open
    /// trial slot, if it holds one.
    pub fn release(&self, admission: Admission) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && admission.generation == inner.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record that an admitted operation succeeded.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.on_success(&mut inner);
    }

    /// Record that an admitted operation failed.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.on_failure(&mut inner);
    }

    fn on_success(&self, inner: &mut BreakerState) {
        inner.success_count += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Closed);
                inner.failure_count = 0;
                inner.half_open_in_flight = 0;
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerState) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.set_state(inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Open);
                inner.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state. Does not move OPEN to HALF_OPEN; only `admit()` does.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// How long a rejected caller should wait before asking again: the rest
    /// of the open window, or a full reset timeout while every half-open
    /// trial slot is taken. `None` when calls would be admitted now.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.reset_timeout.saturating_sub(at.elapsed()))
            }
            (CircuitState::HalfOpen, _)
                if inner.half_open_in_flight >= self.config.half_open_max_calls =>
            {
                Some(self.config.reset_timeout)
            }
            _ => None,
        }
    }

    /// Snapshot of state and counters.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            total_failures: inner.total_failures,
            rejected_count: inner.rejected_count,
            state_changes: inner.state_changes,
            half_open_calls_in_flight: inner.half_open_in_flight,
        }
    }

    /// Return to a fresh closed breaker.
    pub fn reset(&self) {
        let mut inner = self.lock();
        // Tickets issued before the reset stay stale.
        let generation = inner.generation + 1;
        *inner = BreakerState {
            generation,
            ..Default::default()
        };
        info!(breaker = %self.name, "circuit reset");
    }

    /// Run `op` under the breaker.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.try_admit() else {
            return Err(CallError::Rejected {
                breaker: self.name.clone(),
            });
        };

        let result = op().await;
        self.settle(admission, result.is_ok());
        result.map_err(CallError::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_secs: u64, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "db",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_reset_timeout(Duration::from_secs(reset_secs))
                .with_half_open_max_calls(half_open),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_closed_open_half_open_closed() {
        let cb = breaker(3, 10, 1);

        for _ in 0..3 {
            assert!(cb.admit());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(!cb.admit());
        assert_eq!(cb.metrics().rejected_count, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.admit());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        let m = cb.metrics();
        assert_eq!(m.state, CircuitState::Closed);
        assert_eq!(m.failure_count, 0);
        assert_eq!(m.state_changes, 3);
    }

    #[test]
    fn test_single_success_clears_streak() {
        let cb = breaker(3, 10, 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_count, 2);
        assert_eq!(cb.metrics().total_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 5, 1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.admit());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.admit());

        let left = cb.retry_after().unwrap();
        assert_eq!(left, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_calls() {
        let cb = breaker(1, 1, 2);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(cb.admit());
        assert!(cb.admit());
        assert!(!cb.admit());
        assert_eq!(cb.metrics().half_open_calls_in_flight, 2);
        assert_eq!(cb.metrics().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_frees_its_slot() {
        let cb = breaker(1, 1, 1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = cb.try_admit().unwrap();
        assert_eq!(trial.state(), CircuitState::HalfOpen);
        assert!(!cb.admit());
        assert_eq!(cb.retry_after(), Some(Duration::from_secs(1)));

        cb.release(trial);
        let m = cb.metrics();
        assert_eq!(m.state, CircuitState::HalfOpen);
        assert_eq!(m.half_open_calls_in_flight, 0);
        assert_eq!(m.total_failures, 1);
        assert_eq!(cb.retry_after(), None);
        assert!(cb.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_outcome_does_not_decide_half_open() {
        let cb = breaker(1, 1, 1);
        let before_open = cb.try_admit().unwrap();
        assert_eq!(before_open.state(), CircuitState::Closed);

        cb.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = cb.try_admit().unwrap();

        cb.settle(before_open, true);
        let m = cb.metrics();
        assert_eq!(m.state, CircuitState::HalfOpen);
        assert_eq!(m.success_count, 1);
        assert_eq!(m.half_open_calls_in_flight, 1);

        cb.settle(trial, true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_leaves_new_trial_alone() {
        let cb = breaker(1, 1, 1);
        let before_open = cb.try_admit().unwrap();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.admit());

        cb.release(before_open);
        assert_eq!(cb.metrics().half_open_calls_in_flight, 1);
    }

    #[test]
    fn test_reset_returns_to_closed() {
        let cb = breaker(1, 60, 1);
        cb.record_failure();
        assert!(!cb.admit());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.admit());
        assert_eq!(cb.metrics().rejected_count, 0);
    }

    #[tokio::test]
    async fn test_call_does_not_run_when_rejected() {
        let cb = breaker(1, 60, 1);
        let first: Result<(), CallError<&str>> = cb.call(|| async { Err("down") }).await;
        assert!(matches!(first, Err(CallError::Failed("down"))));

        let mut ran = false;
        let second: Result<(), CallError<&str>> = cb
            .call(|| {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(second, Err(CallError::Rejected { .. })));
        assert!(!ran);
        assert_eq!(cb.metrics().total_failures, 1);
    }
}
