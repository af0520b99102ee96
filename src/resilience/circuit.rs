use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GridError, Result};

/// Circuit breaker state. Reads never tear: the state lives in a single
/// atomic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; calls are rejected without reaching the operation
    Open,
    /// Probing recovery with a bounded number of trial calls
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before closing
    pub success_threshold: u32,
    /// Time after the last failure before half-open is attempted
    pub timeout: Duration,
    /// Concurrent calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Three-state circuit breaker with atomic counters.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    half_open_calls: AtomicU32,
    /// Unix nanos of the last recorded failure
    last_failure_ns: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            half_open_calls: AtomicU32::new(0),
            last_failure_ns: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Run an operation through the breaker. When open, returns
    /// `CircuitOpen` without invoking the operation.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match self.state() {
            CircuitState::Open => {
                if self.timeout_elapsed() {
                    self.set_state(CircuitState::HalfOpen);
                    self.half_open_calls.store(0, Ordering::SeqCst);
                    self.successes.store(0, Ordering::SeqCst);
                } else {
                    return Err(GridError::CircuitOpen);
                }
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {}
        }

        if self.state() == CircuitState::HalfOpen {
            let admitted = self
                .half_open_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |calls| {
                    if calls < self.config.half_open_max_calls {
                        Some(calls + 1)
                    } else {
                        None
                    }
                })
                .is_ok();
            if !admitted {
                return Err(GridError::CircuitOpen);
            }
        }

        let result = op().await;
        self.record(result.is_ok());
        result
    }

    fn record(&self, success: bool) {
        let state = self.state();

        if success {
            self.failures.store(0, Ordering::SeqCst);
            let successes = self.successes.fetch_add(1, Ordering::SeqCst) + 1;

            if state == CircuitState::HalfOpen && successes >= self.config.success_threshold {
                self.set_state(CircuitState::Closed);
                info!("circuit closed after successful recovery");
            }
        } else {
            self.successes.store(0, Ordering::SeqCst);
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            self.last_failure_ns
                .store(now_nanos(), Ordering::SeqCst);

            if state == CircuitState::HalfOpen {
                // Any failure while probing reopens the circuit
                self.set_state(CircuitState::Open);
                warn!("circuit reopened by failure in half-open state");
            } else if failures >= self.config.failure_threshold {
                self.set_state(CircuitState::Open);
                warn!(failures, "circuit opened by failure threshold");
            }
        }
    }

    fn timeout_elapsed(&self) -> bool {
        let last = self.last_failure_ns.load(Ordering::SeqCst);
        let elapsed_ns = now_nanos().saturating_sub(last);
        elapsed_ns >= self.config.timeout.as_nanos() as i64
    }

    /// Force the breaker back to closed, clearing all counters.
    pub fn reset(&self) {
        self.set_state(CircuitState::Closed);
        self.failures.store(0, Ordering::SeqCst);
        self.successes.store(0, Ordering::SeqCst);
        self.half_open_calls.store(0, Ordering::SeqCst);
        info!("circuit breaker manually reset");
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(20),
            half_open_max_calls: 2,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Err(GridError::MarketDataUnavailable("down".to_string())) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Operation must not run while open
        let invoked = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GridError::CircuitOpen)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_closes_after_successes() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn consecutive_failures_reset_by_success() {
        let cb = CircuitBreaker::new(fast_config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        // Never hit 3 consecutive failures
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_clears_open_state() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
    }
}
