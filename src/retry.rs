use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Bounded retries with exponential backoff between attempts.
///
/// The delay after failed attempt `n` (0-based) is `base_delay * 2^n`, so the
/// default policy sleeps 1s then 2s across its three attempts. No jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// Outcome of a policy that ran out of attempts or hit a permanent error
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Sleep inserted after the given failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.pow(attempt.min(16)))
            .unwrap_or(Duration::MAX)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `operation` receives the 0-based attempt number. Errors for which
    /// `is_retryable` returns false end the loop immediately.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let attempts = attempt + 1;
                    if !is_retryable(&err) || attempts >= max_attempts {
                        return Err(RetryError {
                            attempts,
                            last_error: err,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "attempt {}/{} failed: {}; retrying in {:?}",
                        attempts, max_attempts, err, delay
                    );
                    sleep(delay).await;
                    attempt = attempts;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(3, Duration::from_secs(u64::MAX / 4));
        assert_eq!(policy.delay_for(0), Duration::from_secs(u64::MAX / 4));
        assert_eq!(policy.delay_for(16), Duration::MAX);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_sleeps_one_then_two_seconds() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), RetryError<String>> = RetryPolicy::default()
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("API Error".to_string()) }
                },
                |_| true,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "API Error");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let result = RetryPolicy::default()
            .run(
                |attempt| async move {
                    if attempt < 2 {
                        Err(format!("failure {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), RetryError<String>> = RetryPolicy::default()
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("bad request".to_string()) }
                },
                |_| false,
            )
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
