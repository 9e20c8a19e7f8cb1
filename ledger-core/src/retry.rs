//! Retry strategy for optimistic-lock conflicts
//!
//! Exponential backoff with jitter. Only [`Error::PersistenceConflict`] is
//! retried; every other error is returned on the first failure.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry around a fallible async operation
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    /// Create from config
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Calculate delay for nth retry with exponential backoff + jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Execute operation, retrying conflicts up to `max_retries` times
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut operation: F,
        operation_name: &str,
        metrics: Option<&Metrics>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.calculate_delay(attempt);
                    attempt += 1;
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after conflict"
                    );
                    if let Some(metrics) = metrics {
                        metrics.record_conflict_retry();
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Shorthand for a conflict detected during a compare-and-swap check
pub(crate) fn conflict(what: impl Into<String>) -> Error {
    Error::PersistenceConflict(what.into())
}
