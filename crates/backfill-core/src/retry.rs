//! Retry with exponential backoff for bulk writes to the target.
//!
//! Connectivity and command failures are fatal; only transient cluster
//! errors (unavailable, bulk rejected) and I/O errors are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ClusterError, Error, Result};

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Jitter as a fraction of the delay, e.g. 0.1 for ±10%.
    pub jitter_percent: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for bulk writes: 3 attempts, 100ms initial, 5s cap.
    #[must_use]
    pub fn bulk_write() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // attempt is capped at 31
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let jitter_range = base_ms * self.jitter_percent;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Final result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
    /// Includes backoff delays.
    pub elapsed: Duration,
}

/// Execute an async operation with retry and exponential backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_outcome(policy, operation, |_| true).await.result
}

/// Execute an operation with smart retry (only retries if error is retryable).
pub async fn with_smart_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_outcome(policy, operation, is_retryable).await.result
}

/// Execute an async operation with retry, returning detailed outcome.
///
/// `should_retry` decides whether a given error is worth another attempt.
pub async fn with_retry_outcome<T, F, Fut, R>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: R,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&Error) -> bool,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !should_retry(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            attempt,
                            max_attempts = max,
                            error = %e,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Operation failed after all retry attempts"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            elapsed: start.elapsed(),
                        };
                    }
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Check if an error is retryable.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Cluster(e) => match e {
            ClusterError::Unavailable(_) => true,
            ClusterError::BulkRejected { .. } => true,
            ClusterError::IndexNotFound(_) => false,
            ClusterError::IndexAlreadyExists(_) => false,
            ClusterError::InvalidSettings(_) => false,
        },
        Error::Io(_) => true,
        // Fatal per the error taxonomy
        Error::Connectivity { .. } => false,
        Error::CommandFailed { .. } => false,
        Error::DataMismatch(_) => false,
        Error::Snapshot(_) => false,
        Error::Scheduler(_) => false,
        Error::Transform(_) => false,
        Error::Config(_) => false,
        Error::Json(_) => false,
        Error::Runtime(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(max_attempts),
        }
    }

    #[test]
    fn delay_calculation_with_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(5),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(10),
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn jitter_within_range() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.0,
            jitter_percent: 0.1,
            max_attempts: Some(5),
        };

        for _ in 0..100 {
            let delay_ms = policy.delay_for_attempt(0).as_millis() as f64;
            assert!(delay_ms >= 900.0, "delay too small: {delay_ms}");
            assert!(delay_ms <= 1100.0, "delay too large: {delay_ms}");
        }
    }

    #[test]
    fn new_clamps_parameters() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO, 0.5, 3.0, None);
        assert!((policy.backoff_factor - 1.0).abs() < f64::EPSILON);
        assert!((policy.jitter_percent - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = with_retry(&fast_policy(5), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::Cluster(ClusterError::Unavailable("503".into())))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_outcome_on_exhaustion_tracks_attempts() {
        let outcome = with_retry_outcome(
            &fast_policy(3),
            || async { Err::<(), _>(Error::Runtime("always".into())) },
            |_| true,
        )
        .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn smart_retry_stops_on_non_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<()> = with_smart_retry(&fast_policy(5), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Connectivity {
                    cluster: "target".into(),
                    reason: "refused".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn smart_retry_retries_bulk_rejections() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<()> = with_smart_retry(&fast_policy(4), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Cluster(ClusterError::BulkRejected {
                    index: "geonames".into(),
                    reason: "es_rejected_execution_exception".into(),
                }))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        assert!(!is_retryable(&Error::Connectivity {
            cluster: "source".into(),
            reason: "x".into(),
        }));
        assert!(!is_retryable(&Error::CommandFailed {
            command: "start".into(),
            message: "x".into(),
        }));
        assert!(!is_retryable(&Error::DataMismatch("x".into())));
        assert!(!is_retryable(&Error::Cluster(ClusterError::IndexNotFound("i".into()))));
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(is_retryable(&Error::Cluster(ClusterError::Unavailable("x".into()))));
        assert!(is_retryable(&Error::Io(std::io::Error::other("reset"))));
    }
}
