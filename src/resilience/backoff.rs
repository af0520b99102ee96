use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{GridError, Result};

/// Exponential backoff configuration.
#[derive(Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Delay multiplier per attempt (typically 2.0)
    pub multiplier: f64,
    /// Random jitter fraction in [0, 1]; delay scales by 1 ± jitter
    pub jitter_factor: f64,
    /// Maximum retry attempts; 0 means retry forever
    pub max_retries: u32,
    /// Predicate deciding whether an error is worth retrying.
    /// None retries transient errors only.
    pub retryable: Option<Arc<dyn Fn(&GridError) -> bool + Send + Sync>>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_retries: 10,
            retryable: None,
        }
    }
}

impl std::fmt::Debug for BackoffConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffConfig")
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .field("max_retries", &self.max_retries)
            .field("retryable", &self.retryable.is_some())
            .finish()
    }
}

/// Exponential backoff with jitter:
/// `delay_n = min(max_delay, initial * multiplier^n) * (1 ± jitter)`.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: AtomicU32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: AtomicU32::new(0),
        }
    }

    /// Next delay in the sequence; advances the attempt counter.
    pub fn next(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);

        let base = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let jittered = if self.config.jitter_factor > 0.0 {
            let j = self.config.jitter_factor;
            let factor = 1.0 + rand::thread_rng().gen_range(-j..=j);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Reset the attempt counter; the next delay is the first again.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    fn is_retryable(&self, err: &GridError) -> bool {
        match &self.config.retryable {
            Some(pred) => pred(err),
            None => err.is_transient(),
        }
    }

    /// Run `op` until it succeeds, the error is terminal, retries are
    /// exhausted, or the shutdown signal fires mid-wait.
    pub async fn retry<T, F, Fut>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.reset();

        loop {
            if *shutdown.borrow() {
                return Err(GridError::Cancelled);
            }

            match op().await {
                Ok(value) => {
                    self.reset();
                    return Ok(value);
                }
                Err(err) => {
                    if !self.is_retryable(&err) {
                        return Err(err);
                    }

                    if self.config.max_retries > 0 && self.attempts() >= self.config.max_retries {
                        warn!(attempts = self.attempts(), error = %err, "max retries exceeded");
                        return Err(GridError::MaxRetriesExceeded {
                            attempts: self.attempts(),
                        });
                    }

                    let delay = self.next();
                    warn!(attempt = self.attempts(), ?delay, error = %err, "operation failed, retrying");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Err(GridError::Cancelled);
                            }
                        }
                    }
                }
            }
        }
    }
}
