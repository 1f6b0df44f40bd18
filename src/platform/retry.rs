//! Platform API retry with exponential backoff.
//!
//! Only transient failures are retried; permission errors surface on the
//! first attempt. The bound is small: role mutations sit on the path of a
//! user waiting for their access, and the drift monitor covers anything a
//! short retry window misses.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::traits::PlatformError;

/// Backoff policy for platform calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles every retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Retry a platform operation with exponential backoff.
///
/// # Arguments
///
/// * `policy` - Bound and delays
/// * `operation` - The async operation to retry (e.g. `add_roles`)
/// * `is_retryable` - Whether an error is transient
///
/// # Returns
///
/// Result of the operation, or the last error after all retries exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "platform call failed, retrying: {}",
                    err
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Determine if a platform error is retryable (transient).
pub fn is_platform_error_retryable(err: &PlatformError) -> bool {
    err.is_retryable()
}
