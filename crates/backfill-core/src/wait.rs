//! Polling with backoff until a predicate holds, used for snapshot
//! durability. A predicate may abort early when success is impossible.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::time::{Duration, Instant, sleep};

#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the second poll.
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Poll limit, counting the first poll.
    pub max_retries: Option<usize>,
}

impl Backoff {
    /// Constant delay between a bounded number of polls.
    #[must_use]
    pub fn fixed(delay: Duration, max_retries: usize) -> Self {
        Self {
            initial: delay,
            max: delay,
            factor: 1,
            max_retries: Some(max_retries),
        }
    }

    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.saturating_mul(self.factor);
        if next > self.max { self.max } else { next }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(25),
            max: Duration::from_millis(1000),
            factor: 2,
            max_retries: None,
        }
    }
}

/// Result of a predicate check in a wait loop.
#[derive(Debug, Clone)]
pub enum WaitFor<T> {
    /// Predicate satisfied.
    Ready(T),
    /// Predicate not yet satisfied.
    NotReady { last_observed: Option<String> },
    /// Predicate can never be satisfied; stop polling.
    Abort { reason: String },
}

impl<T> WaitFor<T> {
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::Ready(value)
    }

    #[must_use]
    pub fn not_ready(last_observed: impl Into<Option<String>>) -> Self {
        Self::NotReady {
            last_observed: last_observed.into(),
        }
    }
}

/// One pollable condition.
pub trait WaitPredicate {
    type Output: Send;

    /// Shown in timeout errors.
    fn describe(&self) -> String;

    fn check(&mut self) -> Pin<Box<dyn Future<Output = WaitFor<Self::Output>> + Send + 'static>>;
}

/// Helper to build a `WaitPredicate` from a description and closure.
pub struct WaitCondition<F> {
    description: String,
    check: F,
}

impl<F> WaitCondition<F> {
    #[must_use]
    pub fn new(description: impl Into<String>, check: F) -> Self {
        Self {
            description: description.into(),
            check,
        }
    }
}

impl<F, Fut, T> WaitPredicate for WaitCondition<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = WaitFor<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn check(&mut self) -> Pin<Box<dyn Future<Output = WaitFor<Self::Output>> + Send + 'static>> {
        Box::pin((self.check)())
    }
}

/// Why `wait_for` gave up.
#[derive(Debug, Clone)]
pub struct WaitError {
    pub expected: String,
    pub last_observed: Option<String>,
    /// Polls attempted, counting the first.
    pub retries: usize,
    pub elapsed: Duration,
    /// Set when the predicate aborted instead of timing out.
    pub aborted: Option<String>,
}

impl WaitError {
    /// True when the wait ran out of time or retries.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.aborted.is_none()
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.aborted {
            return write!(f, "gave up waiting for {}: {reason}", self.expected);
        }
        let last = self.last_observed.as_deref().unwrap_or("<none>");
        write!(
            f,
            "timeout waiting for {} after {}ms (retries={}, last_observed={})",
            self.expected,
            self.elapsed.as_millis(),
            self.retries,
            last
        )
    }
}

impl std::error::Error for WaitError {}

/// Wait for a predicate to become true within a timeout using backoff.
pub async fn wait_for<P>(
    mut predicate: P,
    timeout: Duration,
    backoff: Backoff,
) -> Result<P::Output, WaitError>
where
    P: WaitPredicate + Send,
{
    let expected = predicate.describe();
    let start = Instant::now();
    let deadline = start + timeout;
    let mut retries = 0usize;
    let mut delay = backoff.initial;
    let mut last_observed = None;

    loop {
        retries = retries.saturating_add(1);
        match predicate.check().await {
            WaitFor::Ready(value) => return Ok(value),
            WaitFor::NotReady { last_observed: obs } => {
                if obs.is_some() {
                    last_observed = obs;
                }
            }
            WaitFor::Abort { reason } => {
                return Err(WaitError {
                    expected,
                    last_observed,
                    retries,
                    elapsed: start.elapsed(),
                    aborted: Some(reason),
                });
            }
        }

        let now = Instant::now();
        let timeout_reached = now >= deadline;
        let retries_exhausted = backoff.max_retries.is_some_and(|max| retries >= max);
        if timeout_reached || retries_exhausted {
            return Err(WaitError {
                expected,
                last_observed,
                retries,
                elapsed: now.saturating_duration_since(start),
                aborted: None,
            });
        }

        let remaining = deadline.saturating_duration_since(now);
        let sleep_for = if delay > remaining { remaining } else { delay };
        if !sleep_for.is_zero() {
            sleep(sleep_for).await;
        }
        delay = backoff.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_schedule_increases_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(70),
            factor: 2,
            max_retries: None,
        };

        let mut delay = backoff.initial;
        delay = backoff.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(20));
        delay = backoff.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(40));
        delay = backoff.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(70));
        delay = backoff.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(70));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let backoff = Backoff::fixed(Duration::from_millis(5), 3);
        assert_eq!(backoff.next_delay(backoff.initial), Duration::from_millis(5));
        assert_eq!(backoff.max_retries, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_returns_ready_value() {
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_clone = Arc::clone(&polls);
        let condition = WaitCondition::new("third poll", move || {
            let n = polls_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if n >= 2 {
                    WaitFor::ready(n)
                } else {
                    WaitFor::not_ready(format!("poll {n}"))
                }
            }
        });

        let value = wait_for(condition, Duration::from_secs(10), Backoff::default())
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_for_timeout_includes_debug_info() {
        let condition = WaitCondition::new("value == 2", || async {
            WaitFor::<u32>::not_ready(Some("1".to_string()))
        });
        let err = wait_for(condition, Duration::from_millis(0), Backoff::default())
            .await
            .expect_err("should timeout");
        assert!(err.is_timeout());
        assert!(err.expected.contains("value == 2"));
        assert_eq!(err.last_observed.as_deref(), Some("1"));
        assert_eq!(err.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_respects_max_retries() {
        let condition =
            WaitCondition::new("never", || async { WaitFor::<()>::not_ready(None::<String>) });
        let err = wait_for(
            condition,
            Duration::from_secs(3600),
            Backoff::fixed(Duration::from_millis(100), 4),
        )
        .await
        .unwrap_err();
        assert_eq!(err.retries, 4);
    }

    #[tokio::test]
    async fn wait_for_abort_stops_immediately() {
        let condition = WaitCondition::new("snapshot durable", || async {
            WaitFor::<()>::Abort {
                reason: "snapshot failed".to_string(),
            }
        });
        let err = wait_for(condition, Duration::from_secs(60), Backoff::default())
            .await
            .unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err.retries, 1);
        assert!(err.to_string().contains("snapshot failed"));
    }
}
