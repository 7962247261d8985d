//! Retry with exponential backoff for provider calls.
//!
//! Every error is retried, rate limits and rejected requests included.
//! Attempts are not idempotent: each retry may yield a different completion.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Waits between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// One attempt plus up to `max_retries` retries
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::try_from_secs_f64(config.delay.max(0.0)).unwrap_or(Duration::MAX),
        )
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Wait after failure number `failure` (1-based): `delay * 2^(failure-1)`
    pub fn backoff(&self, failure: u32) -> Duration {
        let factor = 2u32.checked_pow(failure.saturating_sub(1));
        factor
            .and_then(|f| self.delay.checked_mul(f))
            .unwrap_or(Duration::MAX)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        let mut failures = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    if failures > self.max_retries {
                        return Err(ClientError::ExhaustedRetries {
                            operation: operation.to_string(),
                            retries: self.max_retries,
                            last_error: err.to_string(),
                        });
                    }
                    let wait = self.backoff(failures);
                    warn!(
                        "Attempt {} of {} failed: {}. Retrying in {:.1}s",
                        failures,
                        operation,
                        err,
                        wait.as_secs_f64()
                    );
                    self.sleeper.sleep(wait).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("delay", &self.delay)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records requested waits without sleeping
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub waits: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
        }
    }

    pub(crate) fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_secs(1))
            .with_sleeper(Arc::new(RecordingSleeper::default()))
    }

    #[tokio::test]
    async fn test_backoff_schedule_then_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy::new(5, Duration::from_secs(1)).with_sleeper(sleeper.clone());
        let calls = AtomicU32::new(0);

        let result = policy
            .run("generate", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(ClientError::Transient("rate limited".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            *sleeper.waits.lock().unwrap(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausts_without_final_sleep() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy::new(3, Duration::from_secs(1)).with_sleeper(sleeper.clone());
        let calls = AtomicU32::new(0);

        let err = policy
            .run("generate", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClientError::Transient("503".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.waits.lock().unwrap().len(), 3);
        match err {
            ClientError::ExhaustedRetries {
                retries, last_error, ..
            } => {
                assert_eq!(retries, 3);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let policy = instant_policy(0);
        let calls = AtomicU32::new(0);

        let result = policy
            .run("generate", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClientError::Transient("boom".into())) }
            })
            .await;

        assert!(matches!(result, Err(ClientError::ExhaustedRetries { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(64), Duration::MAX);
    }

    #[test]
    fn test_from_config_tolerates_unbounded_delay() {
        let mut config = ClientConfig::default();
        config.delay = f64::INFINITY;
        assert_eq!(RetryPolicy::from_config(&config).backoff(1), Duration::MAX);

        config.delay = f64::NAN;
        assert_eq!(RetryPolicy::from_config(&config).backoff(1), Duration::ZERO);
    }
}
