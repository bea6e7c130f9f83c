//! Bounded in-step retry with exponential backoff.
//!
//! Used by steps for sub-step-local transient failures (a flaky alert check,
//! a host that is still rebooting). The Driver itself never retries.

use crate::error::{Error, Result};
use std::thread;
use std::time::Duration;

/// Configuration for in-step retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// A config that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Callback for retry notifications.
pub trait RetryCallback {
    /// Called before sleeping ahead of the next attempt (1-indexed `attempt`).
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration);
}

/// Callback that logs each retry at `warn`.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration) {
        log::warn!(
            "Attempt {}/{} failed: {}. Retrying in {}ms",
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        );
    }
}

/// Run `operation`, retrying retryable errors up to `config.max_attempts`.
///
/// Non-retryable errors return immediately, unchanged. When every attempt
/// failed with a retryable error the result is [`Error::RetriesExhausted`],
/// which is fatal to the step.
pub fn with_retry<T, F>(
    name: &str,
    config: &RetryConfig,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error: Option<Error> = None;

    for attempt in 0..max_attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                if attempt + 1 < max_attempts {
                    let delay = config.delay_for_attempt(attempt);
                    if let Some(cb) = callback {
                        cb.on_retry(attempt + 1, max_attempts, &e, delay);
                    }
                    thread::sleep(delay);
                }
                last_error = Some(e);
            }
        }
    }

    Err(Error::RetriesExhausted {
        operation: name.to_string(),
        attempts: max_attempts,
        last: last_error.map_or_else(String::new, |e| e.to_string()),
    })
}
