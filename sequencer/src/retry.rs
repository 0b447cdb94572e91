//! Bounded retry with exponential backoff for device reads and commands
//!
//! Only transient failures (timeout, busy, disconnected) are retried; anything
//! else is returned to the caller on the first occurrence so the calling
//! algorithm can decide whether it is fatal.

use crate::error::{DeviceError, DeviceResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt deadline; an attempt that exceeds it counts as a timeout
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Some(Duration::from_secs(2)),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no deadline
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            attempt_timeout: None,
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the policy's
/// attempts are used up. The last error is returned.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> DeviceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match policy.attempt_timeout {
            Some(limit) => match timeout(limit, f()).await {
                Ok(result) => result,
                Err(_) => Err(DeviceError::timeout(operation, limit)),
            },
            None => f().await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.calculate_delay(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
