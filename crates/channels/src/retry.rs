use std::time::Duration;

use switchboard_core::config::ChannelsConfig;

/// Bounded exponential retry used for transport reconnects and outbound sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    pub fn immediate(max_retries: u32) -> Self {
        Self { max_retries, base_delay_ms: 0, max_delay_ms: 0 }
    }

    pub fn for_sends(config: &ChannelsConfig) -> Self {
        Self {
            max_retries: config.send_max_retries,
            base_delay_ms: config.send_base_delay_ms,
            max_delay_ms: config.send_max_delay_ms,
        }
    }

    pub fn for_reconnects(config: &ChannelsConfig) -> Self {
        Self {
            max_retries: config.reconnect_max_retries,
            base_delay_ms: config.reconnect_base_delay_ms,
            max_delay_ms: config.reconnect_max_delay_ms,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use switchboard_core::config::AppConfig;

    use super::RetryPolicy;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 8, base_delay_ms: 100, max_delay_ms: 1_000 };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn reconnects_and_sends_use_separate_budgets() {
        let mut config = AppConfig::default().channels;
        config.send_max_retries = 2;
        config.reconnect_max_retries = 9;

        assert_eq!(RetryPolicy::for_sends(&config).max_retries, 2);
        let reconnects = RetryPolicy::for_reconnects(&config);
        assert_eq!(reconnects.max_retries, 9);
        assert_eq!(reconnects.backoff(0), Duration::from_millis(config.reconnect_base_delay_ms));
    }
}
