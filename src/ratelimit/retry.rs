// Generic bounded retry for call-level failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::Result;

const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Invokes `op` up to `max_attempts` times with exponential backoff
/// (1s, 2s, 4s...). Only errors classified retryable are retried;
/// anything else surfaces unchanged on the first occurrence.
pub async fn retry_with_backoff<T, F, Fut>(max_attempts: u32, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1));
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    label, attempt, max_attempts, err, backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(3, "probe", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BotError::Transient("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_with_backoff(2, "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BotError::Transient("timeout".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_with_backoff(3, "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BotError::MalformedResponse("not JSON".into())) }
        })
        .await;

        assert!(matches!(result, Err(BotError::MalformedResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
