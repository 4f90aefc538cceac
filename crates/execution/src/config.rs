//! Engine configuration.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use taskmill_resilience::CircuitBreakerConfig;

/// Tunables for [`crate::ExecutionEngine`]. Durations are encoded as
/// seconds; every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling on executions holding a slot at once
    pub max_concurrent_executions: usize,

    /// Control loop period
    #[serde(with = "taskmill_core::duration_secs")]
    pub tick_interval: Duration,

    /// Running deadline for executions that do not set one
    #[serde(with = "taskmill_core::duration_secs")]
    pub default_timeout: Duration,

    /// Cap on computed retry delays
    #[serde(with = "taskmill_core::duration_secs")]
    pub max_retry_delay: Duration,

    /// Jitter fraction for exponential backoff
    pub retry_jitter: f64,

    /// Status events buffered per subscriber
    pub event_capacity: usize,

    /// Longest wait for the store to accept one snapshot
    #[serde(with = "taskmill_core::duration_secs")]
    pub persist_timeout: Duration,

    /// Config for breakers without an override
    pub breaker: CircuitBreakerConfig,

    /// Per-breaker config, by breaker name
    pub breaker_overrides: HashMap<String, CircuitBreakerConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            tick_interval: Duration::from_millis(100),
            default_timeout: Duration::from_secs(3600),
            max_retry_delay: Duration::from_secs(300),
            retry_jitter: 0.1,
            event_capacity: 1024,
            persist_timeout: Duration::from_secs(5),
            breaker: CircuitBreakerConfig::default(),
            breaker_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Set the concurrency ceiling.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    /// Set the control loop period.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the default running deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the retry delay cap.
    pub fn with_max_retry_delay(mut self, max: Duration) -> Self {
        self.max_retry_delay = max;
        self
    }

    /// Set the backoff jitter fraction.
    pub fn with_retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Set how long a snapshot write may take before it is abandoned.
    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    /// Set the default breaker config.
    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Override the config of one named breaker.
    pub fn with_breaker_override(
        mut self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.breaker_overrides.insert(name.into(), config);
        self
    }

    /// Config for the breaker called `name`.
    pub fn breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        self.breaker_overrides
            .get(name)
            .copied()
            .unwrap_or(self.breaker)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrent_executions == 0 {
            return Err(EngineError::Config(
                "max_concurrent_executions must be at least 1".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(EngineError::Config("tick_interval must be positive".into()));
        }
        if self.persist_timeout.is_zero() {
            return Err(EngineError::Config("persist_timeout must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(EngineError::Config(format!(
                "retry_jitter must be within [0, 1], got {}",
                self.retry_jitter
            )));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Config("event_capacity must be at least 1".into()));
        }
        let breakers = std::iter::once(("default", &self.breaker)).chain(
            self.breaker_overrides
                .iter()
                .map(|(name, config)| (name.as_str(), config)),
        );
        for (name, breaker) in breakers {
            if breaker.failure_threshold == 0 || breaker.half_open_max_calls == 0 {
                return Err(EngineError::Config(format!(
                    "breaker '{}' needs a positive failure_threshold and half_open_max_calls",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_executions, 10);
        assert_eq!(config.default_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"max_concurrent_executions": 2, "tick_interval": 0.05,
                "breaker_overrides": {"db": {"failure_threshold": 2}}}"#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_executions, 2);
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.breaker_config("db").failure_threshold, 2);
        assert_eq!(config.breaker_config("db").half_open_max_calls, 1);
        assert_eq!(config.breaker_config("other").failure_threshold, 5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::default().with_max_concurrent(0).validate().is_err());
        assert!(EngineConfig::default().with_retry_jitter(1.5).validate().is_err());
        assert!(EngineConfig::default()
            .with_tick_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_persist_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_breaker_override(
                "db",
                CircuitBreakerConfig::default().with_failure_threshold(0)
            )
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_timeout": 30}}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.default_timeout, Duration::from_secs(30));

        let missing = EngineConfig::from_json_file("/nonexistent/taskmill.json");
        assert!(matches!(missing, Err(EngineError::Config(_))));
    }
}
