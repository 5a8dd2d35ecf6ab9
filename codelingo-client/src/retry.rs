//! Bounded exponential backoff for API calls.

use codelingo_core::RequestError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Reads: three retries, 1s doubling up to 30s.
    pub fn queries() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Writes retry at most once.
    pub fn mutations() -> Self {
        Self::new(1, Duration::from_secs(1), Duration::from_secs(30))
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether another attempt is allowed after `failures` failed attempts.
    pub fn should_retry(&self, error: &RequestError, failures: u32) -> bool {
        error.is_retryable() && failures <= self.max_retries
    }

    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    if !self.should_retry(&err, failures) {
                        return Err(err);
                    }
                    let delay = self.delay(failures - 1);
                    tracing::warn!(
                        operation = label,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::queries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> RequestError {
        RequestError::from_status(503, "unavailable")
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::queries();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_client_errors_never_retry() {
        let policy = RetryPolicy::queries();
        assert!(!policy.should_retry(&RequestError::from_status(404, "missing"), 1));
        assert!(!policy.should_retry(&RequestError::SessionExpired, 1));
        assert!(policy.should_retry(&server_error(), 1));
        assert!(policy.should_retry(&server_error(), 3));
        assert!(!policy.should_retry(&server_error(), 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::queries()
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(server_error())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::mutations()
            .run("write", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(server_error()) }
            })
            .await;
        assert_eq!(result, Err(server_error()));
        // One attempt plus one retry.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_client_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::queries()
            .run("read", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RequestError::from_status(400, "bad")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
