//! Bounded retry with a fixed delay between attempts.
//!
//! The cluster and the workload control plane are eventually consistent
//! right after startup, so most harness steps run through [`retry`] or
//! [`retry_if`]. Exhaustion is returned to the caller; the orchestrator
//! maps it to a stage-specific exit code.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Attempt budget and inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Create a policy. An attempt budget of zero is raised to one.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Create a policy from raw, possibly out-of-range values.
    ///
    /// Attempts below one become one and negative delays become zero.
    #[must_use]
    pub fn coerced(max_attempts: i64, delay_secs: i64) -> Self {
        let attempts = u32::try_from(max_attempts.max(1)).unwrap_or(u32::MAX);
        let delay = u64::try_from(delay_secs).unwrap_or(0);
        Self::new(attempts, Duration::from_secs(delay))
    }

    /// Maximum number of times the operation is invoked.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep between two consecutive attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Why a retried operation gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    /// An attempt failed with an error that must not be retried.
    #[error("{operation} failed: {error}")]
    Fatal { operation: String, error: E },
}

/// Run `op` until it succeeds or the policy's attempt budget is spent.
///
/// Every error is treated as retryable.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last error when all attempts fail.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(policy, operation, op, |_| true).await
}

/// Run `op` until it succeeds, the budget is spent, or `is_transient`
/// rejects an error.
///
/// The delay is slept between attempts only, never after the last one.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] for the first non-transient error and
/// [`RetryError::Exhausted`] when all attempts fail.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
    is_transient: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = %operation, attempt, "Operation succeeded after retry");
                } else {
                    debug!(operation = %operation, "Operation succeeded");
                }
                return Ok(value);
            }
            Err(e) if !is_transient(&e) => {
                error!(
                    operation = %operation,
                    attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    error: e,
                });
            }
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation,
                    attempt,
                    error = %e,
                    "Operation failed after max attempts"
                );
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay().as_millis(),
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(policy.delay()).await;
            }
        }
    }
}
