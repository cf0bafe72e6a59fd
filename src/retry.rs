//! Bounded Retry
//!
//! Transient store failures are retried with exponential backoff and a
//! little random jitter. Once the budget is spent the failure escalates to
//! [`Error::FatalProtocol`]. Every sleep observes the cancellation token.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Retry budget and backoff shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before escalating (including the first)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is exhausted
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    if !sleep_or_cancel(cancel, delay).await {
                        return Err(Error::Cancelled);
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(Error::FatalProtocol(format!(
                        "{} failed after {} attempts: {}",
                        what, attempt, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sleep for `delay`; returns false if cancelled first
pub async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy();
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(125));

        let late = policy.backoff(10);
        assert!(late >= Duration::from_millis(250));
        assert!(late <= Duration::from_millis(312));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = policy()
            .run("list", &cancel, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Transient("timeout".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_escalates() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = policy()
            .run("create", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transient("connection reset".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::FatalProtocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = policy()
            .run("create", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::RegistrationConflict {
                    path: "/a/leader".into(),
                    owner: "10.0.0.2".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(Error::RegistrationConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result: Result<()> = policy()
            .run("watch", &cancel, || async { Err(Error::Transient("timeout".into())) })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
