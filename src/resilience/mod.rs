//! Retry and circuit-breaker primitives shared by every venue adapter
//! and the settlement path.

pub mod backoff;
pub mod circuit;

pub use backoff::{Backoff, BackoffConfig};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
