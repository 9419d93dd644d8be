//! Bounded retry for provider calls

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use super::ProviderError;
use crate::config::env_parse;
use crate::error::BillingResult;

/// Backoff and timeout budget for one provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Per-attempt timeout
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> BillingResult<Self> {
        let d = Self::default();
        Ok(Self {
            base_delay: Duration::from_millis(env_parse(
                "PROVIDER_RETRY_BASE_MS",
                d.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(env_parse(
                "PROVIDER_RETRY_MAX_MS",
                d.max_delay.as_millis() as u64,
            )?),
            max_retries: env_parse("PROVIDER_MAX_RETRIES", d.max_retries)?,
            call_timeout: Duration::from_secs(env_parse(
                "PROVIDER_TIMEOUT_SECS",
                d.call_timeout.as_secs(),
            )?),
        })
    }

    /// No waiting between attempts; for tests
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            max_retries,
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Run `call` with per-attempt timeout, retrying transient failures with
    /// exponential backoff and jitter. Configuration errors are not retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.base_delay.as_millis().max(1) as u64)
            .max_delay(self.max_delay)
            .take(self.max_retries)
            .map(jitter);

        let timeout = self.call_timeout;
        Retry::spawn(strategy, || {
            let attempt = call();
            async move {
                let result = match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "{} timed out after {:?}",
                        operation, timeout
                    ))),
                };
                match &result {
                    Ok(_) => Ok(result),
                    Err(e) if e.is_transient() => {
                        tracing::debug!(operation = %operation, error = %e, "Transient provider error - will retry");
                        Err(result)
                    }
                    // Wrapped in Ok to stop retrying
                    Err(_) => Ok(result),
                }
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(3);
        let result = policy
            .run("verify", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Transient("503".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(2);
        let result: Result<(), _> = policy
            .run("verify", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Transient("down".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_config_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(5);
        let result: Result<(), _> = policy
            .run("verify", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Config("no secret".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_calls_time_out_as_transient() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..RetryPolicy::immediate(0)
        };
        let result: Result<(), _> = policy
            .run("verify", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }
}
