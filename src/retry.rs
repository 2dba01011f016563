//! Bounded retry with exponential backoff for fallible async operations.
//!
//! Only errors the classifier whitelists are retried; everything else is
//! returned on the first attempt. The final failure carries the attempt
//! count so callers can log how much budget was spent.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for backoff growth
    pub max_delay: Duration,
    /// Double the delay after each attempt when true, constant otherwise
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            exponential_backoff: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given 1-based failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Error wrapper recording how many attempts were spent before giving up.
#[derive(Debug, thiserror::Error)]
#[error("operation failed after {attempts} attempt(s): {source}")]
pub struct RetryExhausted<E: std::error::Error + 'static> {
    pub attempts: u32,
    #[source]
    pub source: E,
}

/// Executes `operation` up to `config.max_attempts` times, retrying only
/// errors for which `is_retryable` returns true.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= config.max_attempts || !is_retryable(&error) {
                    warn!(attempts = attempt, error = %error, "operation failed, giving up");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        source: error,
                    });
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error, PartialEq)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            exponential_backoff: true,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            exponential_backoff: true,
        };
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(cfg.delay_for_attempt(6), Duration::from_millis(30000));
    }

    #[test]
    fn constant_delay_without_backoff() {
        let cfg = RetryConfig {
            exponential_backoff: false,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for_attempt(4), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = with_retry(&fast(), |e| *e == TestError::Transient, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError::Transient)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<i32, _> =
            with_retry(&fast(), |e| *e == TestError::Transient, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Permanent)
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.source, TestError::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let result: Result<i32, _> = with_retry(&fast(), |_| true, || async {
            Err(TestError::Transient)
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }
}
