//! Retry utilities: exponential backoff with jitter, and the
//! conflict-retried update loop used for every cluster-state mutation.
//!
//! The engine never holds a lock on cluster objects. All writes follow the
//! optimistic-concurrency discipline: read the current object, mutate a copy,
//! conditionally write, and retry on a version conflict. [`retry_on_conflict`]
//! is the single reusable abstraction for that discipline; the operation
//! closure is expected to re-read its object on every attempt.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::{Error, Result};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
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

    /// The backoff used for conflict-retried cluster writes: a handful of
    /// quick attempts, matching the short-lived nature of version conflicts.
    pub fn conflict_backoff() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter, retrying
/// only errors accepted by `should_retry`.
///
/// Retryable failures are repeated until success or `max_attempts` (0 =
/// unbounded); any other error aborts immediately and is returned as-is.
pub async fn retry_with_backoff<F, Fut, T, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e)
                if should_retry(&e)
                    && (config.max_attempts == 0 || attempt < config.max_attempts) =>
            {
                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
            Err(e) => {
                if should_retry(&e) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Run a read-mutate-conditionally-write operation, retrying only on
/// API-server version conflicts, bounded by [`RetryConfig::conflict_backoff`].
///
/// Any non-conflict error aborts immediately and is returned to the caller.
pub async fn retry_on_conflict<F, Fut, T>(operation_name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    retry_with_backoff(
        &RetryConfig::conflict_backoff(),
        operation_name,
        Error::is_conflict,
        operation,
    )
    .await
}

/// Convenience helper for conflict errors in tests and mock stores.
pub fn conflict_error() -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}
