//! Backoff schedule for retrying a node.

use std::time::Duration;

use crate::config::RoutingConfig;

/// Exponential backoff across a small attempt budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs_f64(config.backoff_base_secs.max(0.0)),
        )
    }

    /// Total attempts per node.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay after failed attempt `attempt` (0-based), or `None` when the
    /// budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.base_delay.saturating_mul(2u32.saturating_pow(attempt)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}
