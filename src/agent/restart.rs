//! Bounded relaunch policy for remote-shell agents

use crate::config::RestartConfig;
use std::time::Duration;

/// Exponential backoff with a hard attempt cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before relaunch attempt `attempt` (1-based), or `None` once the
    /// cap is exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: Duration::from_millis(config.delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.delay_ms)),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}
