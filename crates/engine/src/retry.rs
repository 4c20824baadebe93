//! Retry with exponential backoff
//!
//! Only `Transient` errors are retried. Conflicts and fatal errors return
//! on the first attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use ferry_core::FerryResult;

/// Backoff policy for calls that may fail transiently
///
/// Attempt `n` (zero-based) sleeps `base_delay_ms * 2^n`, capped at
/// `max_delay_ms`, before the next try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; zero disables retrying
    pub max_retries: usize,
    /// First backoff step
    pub base_delay_ms: u64,
    /// Backoff ceiling
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Replace the retry count
    pub fn with_max_retries(self, max_retries: usize) -> Self {
        Self { max_retries, ..self }
    }

    /// Replace the first backoff step
    pub fn with_base_delay_ms(self, base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            ..self
        }
    }

    /// Replace the backoff ceiling
    pub fn with_max_delay_ms(self, max_delay_ms: u64) -> Self {
        Self {
            max_delay_ms,
            ..self
        }
    }

    pub(crate) fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u64.checked_shl(attempt as u32).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails non-transiently or retries run out
    ///
    /// `what` names the operation in debug logs.
    pub(crate) fn run<T, F>(&self, what: &str, mut op: F) -> FerryResult<T>
    where
        F: FnMut() -> FerryResult<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && !e.is_interrupted() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    debug!(
                        target: "ferry::retry",
                        what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
