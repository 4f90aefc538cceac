//! Fault isolation for calls to external collaborators.
//!
//! A [`CircuitBreaker`] stops calling a failing dependency until it has had
//! time to recover; a [`CircuitBreakerRegistry`] hands out one breaker per
//! named resource.

#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    Admission, BreakerMetrics, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use registry::CircuitBreakerRegistry;
