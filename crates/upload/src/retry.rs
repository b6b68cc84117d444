//! Retry decisions and exponential backoff with jitter.

use std::time::Duration;

use directup_protocol::{ErrorClass, NetworkStatus};
use rand::Rng;

use crate::config::UploadConfig;
use crate::error::UploadError;

/// Jitter factor bounds applied to every backoff delay.
pub const JITTER_MIN: f64 = 0.85;
pub const JITTER_MAX: f64 = 1.15;

/// Exponential backoff with jitter, capped at a maximum delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.retry_attempts,
            config.retry_delay_base(),
            config.retry_delay_max(),
        )
    }

    /// Decides whether a failed attempt should be retried.
    ///
    /// `attempt` is the number of retries already made for this file.
    pub fn should_retry(
        &self,
        error: &UploadError,
        attempt: u32,
        cancelled: bool,
        network: NetworkStatus,
    ) -> bool {
        if cancelled || network == NetworkStatus::Offline {
            return false;
        }
        if attempt >= self.max_attempts {
            return false;
        }
        matches!(
            error.class(),
            ErrorClass::Retryable | ErrorClass::AuthRefresh
        )
    }

    /// Backoff before retry number `attempt + 1`, with random jitter.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, jitter)
    }

    /// `min(max, base × 2^attempt × jitter)`; jitter is clamped to its bounds.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        // 2^31 already dwarfs any sane cap.
        let factor = 2f64.powi(attempt.min(31) as i32);
        let millis = self.base.as_millis() as f64 * factor * jitter;
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}
