//! Backoff policies for work that may fail transiently.
//!
//! [`RetryConfig::delay_for`] is the deterministic per-item delay used by the
//! reconcile queue. [`retry_with_backoff`] wraps a single async operation and
//! adds jitter so replicas do not retry in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Exponential backoff parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Per-item rate limit for the reconcile queue: 5ms doubling up to 1000s
    pub fn work_queue() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    ///
    /// Non-decreasing in `attempt` and capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.min(i32::MAX as u32) as i32);
        let nanos = (self.initial_delay.as_nanos() as f64 * factor)
            .min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success or until `max_attempts` is exhausted, in which case
/// the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but gives up immediately on errors for which
/// `should_retry` returns false.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed with a permanent error"
            );
            return Err(e);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = config.delay_for(attempt - 1).mul_f64(jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}
