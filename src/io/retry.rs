//! Exponential backoff for connection attempts
//!
//! Only errors that [`TransportError::is_transient`] classifies as transient
//! are retried; everything else fails on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::io::transport::TransportError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 5;
pub const DEFAULT_JITTER: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, `0.5` means ±50 %
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let mut backoff = self.base_delay.min(self.max_delay);
        for _ in 1..attempt {
            if backoff == self.max_delay {
                break;
            }
            backoff = backoff.saturating_mul(2).min(self.max_delay);
        }
        backoff
    }

    /// Delay after the given failed attempt with jitter applied; never
    /// exceeds `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return backoff;
        }
        // Uniform in [-jitter, jitter)
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        backoff.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the policy's attempts are used up
///
/// Exhaustion yields a single [`TransportError::ConnectFailed`] carrying the
/// last underlying error.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => {
                debug!(
                    "retry: non-transient failure on attempt {}: {}",
                    attempt, err
                );
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                warn!("retry: giving up after {} attempts: {}", attempt, err);
                return Err(TransportError::ConnectFailed {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "retry: attempt {}/{} failed ({}), retrying in {:?}",
                    attempt, max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: 0.5,
        }
    }

    #[test]
    fn test_exponential_schedule_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.base_delay_for(64), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();

        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(100), "{delay:?}");
            assert!(delay <= Duration::from_millis(300), "{delay:?}");
            assert!(policy.delay_for(20) <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_transient_error_retries_exact_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = retry_with_backoff(&fast_policy(3), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Process("exited early".to_string())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(TransportError::ConnectFailed { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, TransportError::Process(_)));
            }
            other => panic!("Expected ConnectFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_transient_error_never_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = retry_with_backoff(&fast_policy(5), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::NotConnected) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let result = retry_with_backoff(&fast_policy(3), |attempt| async move {
            if attempt < 3 {
                Err(TransportError::Io(std::io::Error::from(
                    std::io::ErrorKind::BrokenPipe,
                )))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }
}
