//! Retry Scheduling
//!
//! Decides how long to wait before retrying a resource whose last pass
//! failed. The fixed ten second delay is the default; exponential backoff
//! is tracked per resource and reset by a clean pass.

use crate::domain::ports::ResourceKey;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use std::time::Duration;

/// Delay before retrying a failed pass
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// How retry delays grow across consecutive failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(DEFAULT_RETRY_DELAY)
    }
}

/// Per-resource retry state
#[derive(Default)]
pub struct RetryTracker {
    policy: RetryPolicy,
    backoffs: DashMap<ResourceKey, ExponentialBackoff>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            backoffs: DashMap::new(),
        }
    }

    /// Delay before the next attempt after a failure of `key`
    pub fn next_delay(&self, key: &ResourceKey) -> Duration {
        match self.policy {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { initial, max } => {
                let mut backoff = self
                    .backoffs
                    .entry(key.clone())
                    .or_insert_with(|| exponential(initial, max));
                backoff.next_backoff().unwrap_or(max).min(max)
            }
        }
    }

    /// Forget failures of `key`
    pub fn reset(&self, key: &ResourceKey) {
        self.backoffs.remove(key);
    }
}

fn exponential(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: max,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}
