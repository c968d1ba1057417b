use crate::delivery::{DeferralKind, DeliveryOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Delay after the first ordinary deferral; doubles with each
    /// subsequent deferral
    #[serde(default = "RetryPolicy::default_base_interval", with = "humantime_serde")]
    pub base_interval: Duration,

    #[serde(default = "RetryPolicy::default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// Fixed delay after the destination signalled that it is unavailable
    #[serde(default = "RetryPolicy::default_short_delay", with = "humantime_serde")]
    pub service_unavailable_delay: Duration,

    /// Fixed delay after a throttle denial
    #[serde(default = "RetryPolicy::default_short_delay", with = "humantime_serde")]
    pub throttled_delay: Duration,

    /// Fixed delay when no connection could be obtained locally
    #[serde(default = "RetryPolicy::default_short_delay", with = "humantime_serde")]
    pub local_capacity_delay: Duration,

    /// Messages queued for longer than this fail on their next pickup
    #[serde(default = "RetryPolicy::default_max_age", with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval: Self::default_base_interval(),
            max_interval: Self::default_max_interval(),
            service_unavailable_delay: Self::default_short_delay(),
            throttled_delay: Self::default_short_delay(),
            local_capacity_delay: Self::default_short_delay(),
            max_age: Self::default_max_age(),
        }
    }
}

/// What happens to a message after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// The message leaves the queue
    Done,
    Retry {
        deferred_count: u32,
        delay: chrono::Duration,
    },
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl RetryPolicy {
    fn default_base_interval() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_max_interval() -> Duration {
        Duration::from_secs(3 * 60 * 60)
    }

    fn default_short_delay() -> Duration {
        Duration::from_secs(60)
    }

    fn default_max_age() -> Duration {
        Duration::from_secs(86400 * 7) // 1 week
    }

    /// The delay following the `deferred_count`th ordinary deferral:
    /// `min(base * 2^(n-1), max)`
    pub fn delay_for_deferral(&self, deferred_count: u32) -> chrono::Duration {
        let exponent = deferred_count.saturating_sub(1);
        let delay = self
            .base_interval
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_interval);
        to_chrono(delay)
    }

    pub fn is_expired(&self, queued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(queued_at) > to_chrono(self.max_age)
    }

    /// Decide the next step for a message that had `deferred_count`
    /// ordinary deferrals before this attempt
    pub fn schedule(&self, outcome: &DeliveryOutcome, deferred_count: u32) -> Schedule {
        match outcome {
            DeliveryOutcome::Delivered { .. } | DeliveryOutcome::Failed { .. } => Schedule::Done,
            DeliveryOutcome::Throttled => Schedule::Retry {
                deferred_count,
                delay: to_chrono(self.throttled_delay),
            },
            DeliveryOutcome::Deferred { kind, .. } => match kind {
                DeferralKind::Transient => {
                    let deferred_count = deferred_count.saturating_add(1);
                    Schedule::Retry {
                        deferred_count,
                        delay: self.delay_for_deferral(deferred_count),
                    }
                }
                DeferralKind::ServiceUnavailable => Schedule::Retry {
                    deferred_count,
                    delay: to_chrono(self.service_unavailable_delay),
                },
                DeferralKind::LocalCapacity => Schedule::Retry {
                    deferred_count,
                    delay: to_chrono(self.local_capacity_delay),
                },
            },
        }
    }
}
