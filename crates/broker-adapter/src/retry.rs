//! Bounded-backoff retry for the adapter boundary.

use std::future::Future;
use std::time::Duration;

use crate::types::{AdapterError, AdapterResult};

/// Retry a call while it fails with a retryable kind, doubling the delay
/// each attempt up to `max_delay`. Permanent and auth errors pass through
/// immediately.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    mut call: F,
) -> AdapterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let mut delay = initial_delay;
    let mut last: Option<AdapterError> = None;

    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient broker failure"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last.unwrap_or_else(|| AdapterError::Transient(format!("{what}: retries exhausted"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            "test",
            5,
            Duration::from_millis(10),
            Duration::from_millis(100),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AdapterError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: AdapterResult<i32> = with_retry(
            "test",
            5,
            Duration::from_millis(1),
            Duration::from_millis(10),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AdapterError::Permanent("nope".into()))
            },
        )
        .await;
        assert!(matches!(result.unwrap_err(), AdapterError::Permanent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let result: AdapterResult<i32> = with_retry(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(10),
            || async { Err(AdapterError::RateLimited("slow down".into())) },
        )
        .await;
        assert!(matches!(result.unwrap_err(), AdapterError::RateLimited(_)));
    }
}
