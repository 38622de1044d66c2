//! Transient-failure retry with capped exponential backoff.
//!
//! Retryable: no HTTP status (network-level failure), 429, or any 5xx.
//! Aborts are never retried. Delay for attempt n is
//! `min(max_delay, base * 2^(n-1), 32 * base)` and honors cancellation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use veil_types::{Error, ErrorCode, Result};

/// Retry configuration. `attempts` counts total tries; 1 means no retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 500,
            max_delay_ms: 16_000,
        }
    }
}

impl RetryPolicy {
    pub fn normalized(mut self) -> Self {
        self.attempts = self.attempts.max(1);
        self
    }

    /// Backoff before retry number `attempt` (1-based count of failures so
    /// far).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(63));
        let capped = exp.min(self.base_delay_ms.saturating_mul(32));
        Duration::from_millis(capped.min(self.max_delay_ms))
    }
}

pub fn is_retryable(err: &Error) -> bool {
    if err.is_aborted() {
        return false;
    }
    match err.status() {
        None => true,
        Some(429) => true,
        Some(status) => status >= 500,
    }
}

/// Sleep that aborts early when the token fires.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
    code: ErrorCode,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::aborted(code)),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `operation` under the retry policy. Every delay observes the
/// cancellation token.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::aborted(ErrorCode::Sync));
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts && is_retryable(&err) => {
                tracing::debug!(attempt, error = %err, "retrying after transient failure");
                sleep_cancellable(policy.delay_for(attempt), cancel, ErrorCode::Sync).await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use veil_types::ErrorDetail;

    fn http_error(status: u16) -> Error {
        Error::sync(format!("status {}", status))
            .with_detail(ErrorDetail::http(Some(status), "http://indexer", None))
    }

    #[test]
    fn classification_matches_policy() {
        assert!(is_retryable(&Error::sync("connection reset")));
        assert!(is_retryable(&http_error(429)));
        assert!(is_retryable(&http_error(500)));
        assert!(is_retryable(&http_error(503)));
        assert!(!is_retryable(&http_error(404)));
        assert!(!is_retryable(&http_error(400)));
        assert!(!is_retryable(&Error::aborted(ErrorCode::Sync)));
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 80,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(80));
        // max_delay_ms wins from here on.
        assert_eq!(policy.delay_for(7), Duration::from_millis(80));

        // Without a tight max, the 32x base cap applies.
        let policy = RetryPolicy {
            attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 10_000,
        };
        assert_eq!(policy.delay_for(9), Duration::from_millis(320));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(http_error(503))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_exhausted_returns_last_error() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = with_retry(&policy, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(http_error(503)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = with_retry(&policy, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(http_error(404)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_delay() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = with_retry(&policy, &cancel, || async { Err::<u32, _>(http_error(503)) })
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }
}
