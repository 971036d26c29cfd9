//! Bounded retry of units of work that lose a store-level race.
//!
//! Only [`LedgerError::Contention`] is retried. Business-rule failures are
//! returned on the spot: a refund over the cap fails the same way every time.

use crate::error::LedgerError;
use crate::services::metrics::MetricsSink;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Backoff before the first retry. Zero retries immediately.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with the specified max retries.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self::with_max_retries(0)
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Calculate backoff duration for a given attempt.
    fn backoff_duration(&self, attempt: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `unit_of_work` until it succeeds, fails with a non-contention error,
/// or has used up `config.max_retries` retries. Each retry is reported to
/// `metrics`.
///
/// `unit_of_work` must start a fresh store transaction on every call.
pub async fn run_with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    metrics: &dyn MetricsSink,
    unit_of_work: F,
) -> Result<T, LedgerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0;

    loop {
        match unit_of_work().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation,
                        attempt = attempt + 1,
                        "Transaction committed after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_contention() => return Err(err),
            Err(err) => {
                if attempt >= config.max_retries {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "Transaction aborted after max retries"
                    );
                    return Err(err);
                }

                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transaction aborted by contention, retrying"
                );
                metrics.record_retry(operation);

                if !backoff.is_zero() {
                    sleep(backoff).await;
                }
                attempt += 1;
            }
        }
    }
}
