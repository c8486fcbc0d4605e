//! Retry budget and backoff for verification email delivery.

use std::time::Duration;

use crate::config::DispatchConfig;

/// `max_retries` counts delivery attempts: the job is dead-lettered after the
/// `max_retries`-th failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: Duration::from_secs(config.retry_base_delay_secs),
            max_delay: Duration::from_secs(config.retry_max_delay_secs),
        }
    }
}

impl RetryPolicy {
    /// Whether a failure on `attempt` (1-based) may be retried.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Backoff before redelivering after a failure on `attempt`: `base * 2^(attempt - 1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub const fn remaining_attempts(&self, attempt: u32) -> u32 {
        self.max_retries.saturating_sub(attempt)
    }
}
