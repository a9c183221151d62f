//! Exponential-backoff retry execution
//!
//! `RetryPolicy` wraps any fallible async operation and retries it on a
//! capped exponential schedule. The wrapper is decision-agnostic: it retries
//! every error it sees, and callers wrap only the operations they consider
//! transient (see [`crate::Error::is_retryable`]).

use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry schedule for a single operation
///
/// The delay before retry `n` (0-indexed) is
/// `min(base_delay_ms * backoff_factor^n, max_delay_ms)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt (default: 3)
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub base_delay_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_factor: f64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with explicit parameters
    pub fn new(max_attempts: u32, base_delay_ms: u64, backoff_factor: f64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            backoff_factor,
            max_delay_ms,
        }
    }

    /// Backoff duration before retry `attempt` (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.base_delay_ms as f64) * self.backoff_factor.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(backoff_ms as u64)
    }

    /// Check if another retry is allowed after `attempt` retries
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `operation`, retrying on failure until the budget is exhausted
    ///
    /// The operation runs once, then up to `max_attempts` more times with the
    /// backoff schedule between attempts. The last error is returned when
    /// every attempt fails.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !self.should_retry(attempt) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
