use std::time::Duration;

use crate::config::BackoffConfig;

/// Maps a consecutive failure count (starting at 1) to a cooldown length.
pub trait BackoffPolicy: Send + Sync {
    fn cooldown(&self, failure_count: u32) -> Duration;
}

/// `base * multiplier^(failures - 1)`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: u32, max: Duration) -> Self {
        Self { base, multiplier: multiplier.max(1), max }
    }
}

impl From<BackoffConfig> for ExponentialBackoff {
    fn from(config: BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            config.multiplier,
            Duration::from_millis(config.max_ms),
        )
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn cooldown(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1);
        let factor = u64::from(self.multiplier).checked_pow(exponent).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}
