//! Retry with backoff for transient storage failures.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use crate::telemetry::SyncMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay: Duration },
    /// Exponential increase in delay (initial * multiplier^attempt), capped
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let millis = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
                Duration::from_millis(millis.min(max.as_millis() as f64) as u64)
            }
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// How often and how patiently to retry a storage operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: BackoffStrategy::Exponential {
                initial: config.initial_backoff,
                max: config.max_backoff,
                multiplier: config.multiplier,
            },
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Retry up to `max_attempts` total with a fixed delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffStrategy::fixed(delay),
        }
    }

    /// Whether another attempt should follow `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32, error: &SyncError) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts
    }

    /// Run `operation`, retrying retryable failures with backoff.
    ///
    /// Non-retryable errors are returned immediately. When attempts run out
    /// the last error is returned with the attempt count attached.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts_made = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempts_made += 1;
                    if !self.should_retry(attempts_made, &error) {
                        if error.is_retryable() {
                            return Err(error.with_context("attempts", attempts_made));
                        }
                        return Err(error);
                    }

                    let delay = self.backoff.delay_for_attempt(attempts_made - 1);
                    warn!(
                        operation,
                        attempt = attempts_made,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient storage failure, retrying"
                    );
                    SyncMetrics::record_storage_retry(operation);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = BackoffStrategy::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .run("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::storage_unavailable("connection reset"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let err = policy
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::storage_unavailable("pool timed out"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert_eq!(err.details().context["attempts"], 2);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let err = policy
            .run("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SyncError::storage_failed("disk full"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), ErrorCode::StorageFailed);
    }
}
