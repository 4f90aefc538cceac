//! Retry policy: delay computation and retry eligibility.
//!
//! Everything here is pure. The scheduler owns the decision of *when* to
//! retry; this module only answers how long to wait and whether a failure
//! may be retried at all.

use crate::error::ExecutionError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Never retry
    #[default]
    None,
    /// Retry with no delay
    Immediate,
    /// Retry after `base_delay` every time
    FixedDelay,
    /// `base_delay * 2^attempt`, capped and jittered
    ExponentialBackoff,
    /// `base_delay * fib(attempt)`, capped
    FibonacciBackoff,
}

/// Fibonacci number with `fib(0) = fib(1) = 1`, saturating on overflow.
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Delay before the next attempt, or `None` when the strategy never retries.
///
/// `attempt` is the number of retries already consumed. `jitter` is a
/// fraction in `[0, 1]` and only applies to exponential backoff.
pub fn next_delay(
    strategy: RetryStrategy,
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
) -> Option<Duration> {
    next_delay_with_rng(
        strategy,
        attempt,
        base_delay,
        max_delay,
        jitter,
        &mut rand::thread_rng(),
    )
}

/// [`next_delay`] with an explicit random source.
pub fn next_delay_with_rng<R: Rng + ?Sized>(
    strategy: RetryStrategy,
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    rng: &mut R,
) -> Option<Duration> {
    let base = base_delay.as_secs_f64();
    let cap = max_delay.as_secs_f64();

    let secs = match strategy {
        RetryStrategy::None => return None,
        RetryStrategy::Immediate => 0.0,
        RetryStrategy::FixedDelay => base,
        RetryStrategy::ExponentialBackoff => {
            let delay = (base * 2f64.powi(attempt.min(1023) as i32)).min(cap);
            apply_jitter(delay, jitter, rng)
        }
        RetryStrategy::FibonacciBackoff => (base * fibonacci(attempt) as f64).min(cap),
    };

    Some(Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(max_delay))
}

fn apply_jitter<R: Rng + ?Sized>(delay: f64, jitter: f64, rng: &mut R) -> f64 {
    let spread = delay * jitter.clamp(0.0, 1.0);
    if spread <= 0.0 {
        return delay;
    }
    delay + rng.gen_range(-spread..=spread)
}

/// Whether a failure on `attempt` may be retried: attempts must remain and
/// the error must be retryable.
pub fn should_retry(error: &ExecutionError, attempt: u32, max_retries: u32) -> bool {
    attempt < max_retries && error.retryable
}

/// A strategy bundled with its limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff strategy
    pub strategy: RetryStrategy,
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Base delay
    pub base_delay: Duration,
    /// Upper bound for growing strategies
    pub max_delay: Duration,
    /// Jitter fraction for exponential backoff
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_retries: 0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        next_delay(
            self.strategy,
            attempt,
            self.base_delay,
            self.max_delay,
            self.jitter,
        )
    }

    /// Whether `error` on `attempt` should be retried under this policy.
    pub fn should_retry(&self, error: &ExecutionError, attempt: u32) -> bool {
        self.strategy != RetryStrategy::None && should_retry(error, attempt, self.max_retries)
    }
}
