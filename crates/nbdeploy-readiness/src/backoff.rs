//! Exponential backoff for one-shot deploy actions
//!
//! Readiness stages wait on conditions through the poller. Actions such as
//! "create the server" or "upload the stack" instead need a single call to
//! succeed, and retry only while the failure looks transient.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Backoff settings for a retried operation
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Maximum number of attempts, at least 1
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }
}

/// Outcome of [`retry_with_backoff`] when the operation never succeeded
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last error, either permanent or after the final attempt
    Failed(E),
    Cancelled,
}

/// Run `operation` until it succeeds, fails permanently, runs out of
/// attempts, or `cancel` fires.
///
/// Delays grow by `multiplier` up to `max_delay`, with 0.5x-1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &BackoffConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_retryable(&e) || attempt >= max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed"
            );
            return Err(RetryError::Failed(e));
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = jittered.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(jittered) => {}
        }

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> BackoffConfig {
        BackoffConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let result: Result<i32, RetryError<&str>> = retry_with_backoff(
            &fast(3),
            "op",
            &CancellationToken::new(),
            |_| true,
            || async { Ok(42) },
        )
        .await;
        assert!(matches!(result, Ok(42)));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result = retry_with_backoff(
            &fast(5),
            "op",
            &CancellationToken::new(),
            |_: &String| true,
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok("uploaded")
                    }
                }
            },
        )
        .await;
        assert!(matches!(result, Ok("uploaded")));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), _> = retry_with_backoff(
            &fast(5),
            "op",
            &CancellationToken::new(),
            |e: &String| !e.contains("host key"),
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("host key changed".to_string()) }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Failed(ref e)) if e == "host key changed"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), _> = retry_with_backoff(
            &fast(3),
            "op",
            &CancellationToken::new(),
            |_: &String| true,
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("still failing".to_string()) }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Failed(_))));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_does_not_run() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), RetryError<String>> = retry_with_backoff(
            &fast(3),
            "op",
            &cancel,
            |_| true,
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
