//! Timeout and retry with exponential backoff for external calls.

use std::fmt::Display;
use std::future::Future;

use crate::config::RetryPolicy;
use crate::domain::Transient;
use crate::metrics::METRICS;
use crate::obs;

/// Run `op` under `policy`.
///
/// Each attempt is bounded by `policy.call_timeout`; a timeout counts as a
/// transient failure. Non-transient errors return immediately. After
/// `policy.max_attempts` attempts the last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_elapsed) => E::timed_out(policy.call_timeout),
        };

        if !err.is_transient() || attempt >= max_attempts {
            return Err(err);
        }

        let delay = policy.delay_after(attempt);
        obs::emit_retry(operation, attempt, delay, &err);
        METRICS.inc_retries();
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CloneError, ProviderError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ProviderError> =
            retry_with_backoff(&RetryPolicy::immediate(3), "test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(ProviderError::RateLimited("slow down".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ProviderError> =
            retry_with_backoff(&RetryPolicy::immediate(5), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::ContentPolicy("refused".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::ContentPolicy(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CloneError> =
            retry_with_backoff(&RetryPolicy::immediate(2), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CloneError::Network("reset".into())) }
            })
            .await;
        assert!(matches!(result, Err(CloneError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_retryable_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            call_timeout: Duration::from_millis(50),
        };
        let result: Result<(), ProviderError> = retry_with_backoff(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
