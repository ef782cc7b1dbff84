//! Retry with exponential backoff for transient backend errors

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

/// Upper bound for a single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// How often and how patiently to retry a backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry
    pub base_backoff: Duration,
    /// Per-attempt deadline
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 10% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF);
        let jitter_ms = (delay.as_millis() as u64 / 10).max(1);
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    /// Run `call` under the per-attempt timeout, retrying transient failures
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let outcome = match tokio::time::timeout(self.timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::SearchTimeout(self.timeout.as_millis() as u64)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempts < self.max_attempts => {
                    let backoff = self.backoff(attempts);
                    warn!(
                        operation,
                        attempt = attempts,
                        wait_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient backend error, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
