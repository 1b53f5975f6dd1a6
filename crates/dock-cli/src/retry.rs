use std::time::Duration;

use rand::Rng;

use crate::config::PipelineConfig;

/// Bounded exponential backoff; each wait is drawn from the upper half of
/// its ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn for_updates(config: &PipelineConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }

    pub fn for_resolution(config: &PipelineConfig) -> Self {
        Self {
            attempts: config.resolve_attempts,
            ..Self::for_updates(config)
        }
    }

    /// Upper bound of the wait after the `attempt`-th failure (1-based).
    pub fn ceiling_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_ms(attempt);
        let jittered = if ceiling == 0 {
            0
        } else {
            rand::rng().random_range(ceiling / 2..=ceiling)
        };
        Duration::from_millis(jittered)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}
