//! Retry-with-backoff for database operations that can hit a transient
//! write conflict (`TransactionConflict`). Mirrors the shape of a network
//! reconnect loop — config struct, a pure backoff calculator, and an async
//! driver — adapted to the exact parameters this crate's transactional
//! layer needs instead of a socket reconnect.

use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Backoff parameters for retrying a transient database conflict.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
            jitter_fraction: 0.10,
        }
    }
}

impl RetryPolicy {
    /// Linear growth with attempt number, capped, then perturbed by up to
    /// `jitter_fraction` in either direction.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let linear = self.initial_delay.saturating_mul(attempt.max(1));
        let capped = linear.min(self.max_delay);

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-self.jitter_fraction..=self.jitter_fraction);
        let factor = (1.0 + jitter).max(0.0);
        capped.mul_f64(factor)
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping with linear
/// jittered backoff between attempts whenever it returns
/// `Error::TransactionConflict`. Any other error is returned immediately.
/// Honors `cancel`: if it fires while sleeping between attempts, returns
/// `Error::Cancelled` instead of retrying.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::TransactionConflict(msg)) if attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, ?delay, %msg, "retrying after transaction conflict");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_linearly_and_caps() {
        let policy = RetryPolicy {
            jitter_fraction: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_on_conflict_then_succeeds() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = with_retry(&policy, &cancel, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::TransactionConflict("busy".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflict_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy, &cancel, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound("serial".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> =
            with_retry(&policy, &cancel, || async { Err(Error::TransactionConflict("busy".into())) }).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn exhausting_attempts_surfaces_conflict() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_fraction: 0.0,
        };
        let cancel = CancellationToken::new();

        let result: Result<()> =
            with_retry(&policy, &cancel, || async { Err(Error::TransactionConflict("busy".into())) }).await;

        assert!(matches!(result, Err(Error::TransactionConflict(_))));
    }
}
