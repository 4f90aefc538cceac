//! Circuit breaker registry.

use crate::circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Name → breaker lookup. Breakers are created lazily on first reference and
/// live as long as the registry.
///
/// The registry is an ordinary value owned by the composition root and
/// shared by `Arc`; there is no process-global instance.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the breaker for `name`, creating it with `config` if absent.
    /// The config of an existing breaker is left unchanged.
    pub fn get(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "created circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    /// Look up an existing breaker.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Metrics for every breaker, keyed by name.
    pub fn list_all(&self) -> BTreeMap<String, BreakerMetrics> {
        let breakers: Vec<_> = self.lock().values().cloned().collect();
        breakers
            .into_iter()
            .map(|b| (b.name().to_string(), b.metrics()))
            .collect()
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no breaker has been created.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
