//! Fetch policies combining timeout and retry.

use std::future::Future;
use std::time::Duration;

use query_cache::{query_fn, QueryFn};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::timeout::TimeoutConfig;

/// Error type for policy-wrapped fetches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{0}")]
    Failed(String),

    #[error("Attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("Total timeout after {0:?}")]
    TotalTimeout(Duration),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

/// Fetch policy combining timeout and retry configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Timeout configuration.
    pub timeout: TimeoutConfig,
    /// Retry policy.
    pub retry: RetryPolicy,
}

impl FetchPolicy {
    /// Create a new fetch policy.
    pub fn new(timeout: TimeoutConfig, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    /// Run `attempt` under this policy.
    pub async fn run<T, F, Fut>(&self, attempt: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match timeout(self.timeout.total, self.attempts(attempt)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(total = ?self.timeout.total, "fetch exceeded total timeout");
                Err(FetchError::TotalTimeout(self.timeout.total))
            }
        }
    }

    async fn attempts<T, F, Fut>(&self, attempt: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut n = 0;
        loop {
            let error = match timeout(self.timeout.attempt, attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => FetchError::Failed(format!("{err:#}")),
                Err(_) => FetchError::AttemptTimeout(self.timeout.attempt),
            };

            if !self.retry.should_retry(&error, n) {
                if n == 0 {
                    return Err(error);
                }
                return Err(FetchError::Exhausted {
                    attempts: n + 1,
                    last: Box::new(error),
                });
            }

            let delay = self.retry.backoff.delay_for_attempt(n);
            debug!(attempt = n, ?delay, %error, "retrying fetch");
            sleep(delay).await;
            n += 1;
        }
    }

    /// Wrap a query function so every invocation runs under this policy.
    pub fn wrap<T: Send + 'static>(&self, inner: QueryFn<T>) -> QueryFn<T> {
        let policy = self.clone();
        query_fn(move || {
            let policy = policy.clone();
            let inner = inner.clone();
            async move { policy.run(|| inner()).await.map_err(anyhow::Error::from) }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::retry::{BackoffStrategy, RetryCondition};

    fn flaky(calls: Arc<AtomicU32>, failures: u32) -> impl Fn() -> std::future::Ready<anyhow::Result<u32>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                std::future::ready(Err(anyhow::anyhow!("attempt {n} failed")))
            } else {
                std::future::ready(Ok(n))
            }
        }
    }

    fn policy(max_retries: u32) -> FetchPolicy {
        FetchPolicy::new(
            TimeoutConfig::new(Duration::from_secs(1), Duration::from_secs(10)),
            RetryPolicy::new(max_retries).with_backoff(BackoffStrategy::Fixed(Duration::from_millis(100))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = policy(2).run(flaky(calls.clone(), 2)).await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_last_error() {
        let calls = Arc::new(AtomicU32::new(0));

        let err = policy(2).run(flaky(calls.clone(), 10)).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            err,
            FetchError::Exhausted {
                attempts: 3,
                last: Box::new(FetchError::Failed("attempt 2 failed".into())),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retries_returns_error_as_is() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = policy(0).run(flaky(calls, 1)).await.unwrap_err();
        assert_eq!(err, FetchError::Failed("attempt 0 failed".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let mut policy = policy(1);
        policy.retry = policy.retry.with_conditions(vec![RetryCondition::Failure]);

        let err = policy
            .run(|| async {
                sleep(Duration::from_secs(5)).await;
                Ok::<u32, anyhow::Error>(1)
            })
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::AttemptTimeout(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_timeout_bounds_retries() {
        let policy = FetchPolicy::new(
            TimeoutConfig::new(Duration::from_secs(1), Duration::from_millis(2500)),
            RetryPolicy::new(10).with_backoff(BackoffStrategy::None),
        );

        let err = policy
            .run(|| async {
                sleep(Duration::from_secs(5)).await;
                Ok::<u32, anyhow::Error>(1)
            })
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::TotalTimeout(Duration::from_millis(2500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_produces_query_fn() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let inner = query_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::bail!("cold start");
                }
                Ok("ready")
            }
        });

        let wrapped = policy(1).wrap(inner);
        assert_eq!(wrapped().await.unwrap(), "ready");

        let failing = policy(0).wrap(query_fn(|| async { Err::<u8, _>(anyhow::anyhow!("down")) }));
        assert_eq!(failing().await.unwrap_err().to_string(), "down");
    }
}
