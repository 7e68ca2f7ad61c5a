//! Retry logic for transient ARI errors.
//!
//! Provides bounded exponential backoff for commands that fail with
//! server errors, rate limiting or timeouts.

use std::time::Duration;

use super::client::{AriError, AriResult};

/// Retry delays for transient ARI errors (exponential backoff).
const RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// Executes an ARI request with retry logic for transient errors.
///
/// # Arguments
/// * `action` - Action name for logging
/// * `operation` - Closure that performs the request
pub(crate) async fn with_retry<T, F, Fut>(action: &str, mut operation: F) -> AriResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AriResult<T>>,
{
    let mut last_error = None;
    for (attempt, &delay_ms) in std::iter::once(&0)
        .chain(RETRY_DELAYS_MS.iter())
        .enumerate()
    {
        if attempt > 0 {
            log::info!(
                "[ARI] Retrying {} (attempt {}/{}) after {}ms",
                action,
                attempt + 1,
                RETRY_DELAYS_MS.len() + 1,
                delay_ms
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        match operation().await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() => {
                log::warn!("[ARI] {} transient error: {}", action, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.expect("retry loop should have set last_error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let result: AriResult<u32> = with_retry("test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AriError::HttpStatus(503, String::new()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let attempts = AtomicU32::new(0);
        let result: AriResult<u32> = with_retry("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AriError::HttpStatus(400, String::new())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_error() {
        let result: AriResult<u32> = with_retry("test", || async {
            Err(AriError::HttpStatus(500, "boom".to_string()))
        })
        .await;

        match result {
            Err(AriError::HttpStatus(500, msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
