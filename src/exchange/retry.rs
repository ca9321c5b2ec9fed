//! Bounded retry with backoff for idempotent exchange reads.
//!
//! Order placement must never go through here: a retried create could fill twice.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::ExchangeError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay used when the error carries no hint of its own
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
    /// ±25% random jitter
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            use_exponential_backoff: true,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short delays, few retries; used inside a scan cycle
    pub fn fast() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn calculate_delay(&self, attempt: u32, error: &ExchangeError) -> Duration {
        let base = error
            .retry_delay_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.base_delay);

        let delay = if self.use_exponential_backoff && attempt > 0 {
            base.mul_f64(self.backoff_multiplier.powi(attempt as i32))
        } else {
            base
        };
        let delay = delay.min(self.max_delay);

        if self.add_jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or retries run out
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if e.is_fatal() || !e.is_retryable() {
                    tracing::debug!(error = %e, "Non-retryable error, giving up");
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    tracing::warn!(
                        error = %e,
                        attempts = attempt + 1,
                        max_retries = config.max_retries,
                        "Retries exhausted"
                    );
                    return Err(e);
                }

                let delay = config.calculate_delay(attempt, &e);
                tracing::warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying exchange read"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
