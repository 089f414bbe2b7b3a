//! Retry logic with exponential backoff.

use df_core::pipeline::RetryPolicy;
use df_ops::OperationError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Compute the delay before retry attempt `attempt` (0-based).
pub fn compute_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay_ms = (policy.backoff_ms as f64) * policy.backoff_multiplier.powi(attempt as i32);
    let capped = delay_ms.min(policy.max_backoff_ms as f64).max(0.0) as u64;
    Duration::from_millis(capped)
}

/// Check whether we should retry given the attempt number and policy.
pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
    attempt < policy.max_retries
}

/// Run `attempt_fn` until it succeeds, fails permanently, or the policy's
/// retries run out. Backoff sleeps end early on cancellation.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut attempt_fn: F,
) -> Result<T, OperationError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && should_retry(policy, attempt) => {
                let delay = compute_delay(policy, attempt);
                tracing::warn!(
                    node = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OperationError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(node = label, attempts = attempt + 1, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        };

        assert_eq!(compute_delay(&policy, 0), Duration::from_millis(1000));
        assert_eq!(compute_delay(&policy, 1), Duration::from_millis(2000));
        assert_eq!(compute_delay(&policy, 2), Duration::from_millis(4000));
        assert_eq!(compute_delay(&policy, 3), Duration::from_millis(8000));
        assert_eq!(compute_delay(&policy, 4), Duration::from_millis(16000));
        // Capped at 30s
        assert_eq!(compute_delay(&policy, 5), Duration::from_millis(30000));
    }

    #[test]
    fn retry_limit() {
        let policy = RetryPolicy::default(); // max_retries = 3
        assert!(should_retry(&policy, 0));
        assert!(should_retry(&policy, 2));
        assert!(!should_retry(&policy, 3));
    }

    #[tokio::test]
    async fn transient_then_success() {
        let calls = AtomicU32::new(0);
        let out = retry_transient(&fast(3), &CancellationToken::new(), "n", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(OperationError::Upstream { status: 503, message: "busy".into() })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&fast(3), &CancellationToken::new(), "n", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(OperationError::Validation("total missing".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OperationError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&fast(2), &CancellationToken::new(), "n", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(OperationError::Timeout(10)) }
        })
        .await
        .unwrap_err();
        assert_eq!(err, OperationError::Timeout(10));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_ms: 60_000,
            backoff_multiplier: 1.0,
            max_backoff_ms: 60_000,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = retry_transient(&policy, &cancel, "n", |_| async {
            Err::<(), _>(OperationError::Network("reset".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err, OperationError::Cancelled);
    }
}
