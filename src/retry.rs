use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Bounded retries for adapter calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    pub initial_backoff: Duration,
    /// Per-attempt limit; an attempt that exceeds it fails with `Error::Timeout`.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_ms: u64, timeout: Option<Duration>) -> Self {
        Self {
            retries,
            initial_backoff: Duration::from_millis(backoff_ms),
            timeout,
        }
    }

    pub fn none() -> Self {
        Self::new(0, 0, None)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retries are used up. Backoff doubles after every failed attempt.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout(format!("{label} exceeded {limit:?}"))),
            },
            None => op().await,
        };

        match result {
            Err(e) if e.is_retryable() && attempt <= policy.retries => {
                warn!(
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying {label} after transient error"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retries(RetryPolicy::new(3, 1, None), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Provider("503".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries(RetryPolicy::new(2, 1, None), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Process("spawn failed".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries(RetryPolicy::new(5, 1, None), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Runner {
                exit_code: 101,
                stderr: "compile error".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(Error::Runner { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(1, 1, Some(Duration::from_millis(20)));
        let result: Result<()> = with_retries(policy, "slow op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(Error::Timeout(msg)) => assert!(msg.contains("slow op")),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
