//! Retry logic for transient transport failures
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  ThreadedSender  │ one job: send a batch, probe the server
//! └──────┬───────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_attempts: 3           │
//! │  - initial_backoff: 0        │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait backoff(0)
//!        └─→ Attempt 3: Wait backoff(1)
//! ```
//!
//! Only errors for which [`ClientError::is_retryable`] holds are retried.
//! Record-level failures (bad encoding, invalid schema) return at once.
//!
//! The default policy retries immediately: after the last attempt the
//! submitter marks the server disconnected and its reconnect schedule takes
//! over the pacing.

use crate::error::{ClientError, Result};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Attempt budget and backoff between attempts.
///
/// ```text
/// backoff(n) = min(initial_backoff * multiplier^n, max_backoff)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default: 3)
    pub max_attempts: usize,

    /// Wait before the second attempt (default: none)
    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier: 2.0,
        }
    }

    /// Wait after failed attempt `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }

    /// Whether another attempt should follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: usize, error: &ClientError) -> bool {
        error.is_retryable() && attempt + 1 < self.max_attempts
    }
}

/// Run `operation` against `target` until it succeeds, fails permanently,
/// or the policy's attempts run out. Returns the last error.
///
/// The operation borrows `target` mutably for one attempt at a time, so it
/// can drive a stateful sender.
pub async fn retry_with_backoff<S, T, F>(policy: &RetryPolicy, target: &mut S, mut operation: F) -> Result<T>
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation(&mut *target).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if policy.should_retry(attempt, &e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retryable error, retrying"
                );
                if !backoff.is_zero() {
                    sleep(backoff).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(300));
        assert_eq!(RetryPolicy::default().backoff(4), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_transport_errors_use_whole_budget() {
        let mut attempts = 0usize;
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), &mut attempts, |n| {
            Box::pin(async move {
                *n += 1;
                Err(ClientError::Transport("connection refused".into()))
            })
        })
        .await;

        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let mut attempts = 0usize;
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), &mut attempts, |n| {
            Box::pin(async move {
                *n += 1;
                Err(ClientError::SerializationError("bad".into()))
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_success_after_failure() {
        let mut attempts = 0usize;
        let result = retry_with_backoff(&RetryPolicy::default(), &mut attempts, |n| {
            Box::pin(async move {
                *n += 1;
                if *n == 1 {
                    Err(ClientError::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(7)
                }
            })
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 2);
    }
}
