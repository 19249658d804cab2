//! Bounded retry of transient failures.

use std::future::Future;
use std::time::Duration;

use crate::config::JobSettings;
use crate::error::{BulkError, BulkResult};

/// Exponential backoff with a cap. Only transient errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_settings(jobs: &JobSettings) -> Self {
        Self::new(jobs.max_retries, jobs.retry_backoff(), jobs.max_backoff())
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Decide what to do with a failed attempt: `Ok(delay)` to retry, or the
    /// error to surface.
    pub fn on_failure(&self, op: &str, attempt: u32, err: BulkError) -> Result<Duration, BulkError> {
        if !err.is_transient() {
            return Err(err);
        }
        if attempt > self.max_retries {
            tracing::warn!(op, attempts = attempt, error = %err, "retry budget exhausted");
            return Err(BulkError::RetriesExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }
        let delay = self.backoff(attempt);
        tracing::debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
        Ok(delay)
    }

    /// Run `f` until it succeeds, fails permanently or the budget runs out.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> BulkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BulkResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = self.on_failure(op, attempt, e)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&JobSettings::default())
    }
}
