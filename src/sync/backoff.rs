//! Retry ceiling and exponential delay between queued attempts.

use std::time::Duration;

use crate::config::SyncConfig;
use crate::queue::DEFAULT_MAX_ATTEMPTS;

/// Retry ceiling plus an optional delay before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      backoff_base: Duration::ZERO,
      backoff_max: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      max_attempts: config.max_attempts,
      backoff_base: Duration::from_millis(config.backoff_base_ms),
      backoff_max: Duration::from_millis(config.backoff_max_ms),
    }
  }

  /// Delay before the attempt following `attempt_count` earlier ones:
  /// `base * 2^(attempt_count - 1)`, capped. First attempts never wait.
  pub fn delay_for(&self, attempt_count: u32) -> Duration {
    if attempt_count == 0 || self.backoff_base.is_zero() {
      return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempt_count - 1);
    self
      .backoff_base
      .checked_mul(factor)
      .unwrap_or(self.backoff_max)
      .min(self.backoff_max)
  }
}
