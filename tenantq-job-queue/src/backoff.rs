//! Retry delay policies.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_MS: u64 = 1_000;
const DEFAULT_MAX_MS: u64 = 300_000;

/// How long a failed job waits before it becomes reservable again.
///
/// Delays never decrease as `attempts` grows, jitter included: the random part
/// for attempt `n` is drawn from `[0, d(n+1) - d(n))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: DEFAULT_BASE_MS,
            max_ms: DEFAULT_MAX_MS,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: duration_ms(delay),
        }
    }

    /// Exponential without jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base_ms: duration_ms(base),
            max_ms: duration_ms(max),
            jitter: false,
        }
    }

    #[must_use]
    pub fn with_jitter(self, enabled: bool) -> Self {
        match self {
            Self::Exponential { base_ms, max_ms, .. } => Self::Exponential {
                base_ms,
                max_ms,
                jitter: enabled,
            },
            fixed => fixed,
        }
    }

    /// Delay to apply after the failure of a job that had `attempts` prior attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                let floor = exponential_ms(base_ms, max_ms, attempts);
                if !jitter {
                    return Duration::from_millis(floor);
                }
                let next = exponential_ms(base_ms, max_ms, attempts.saturating_add(1));
                let spread = next.saturating_sub(floor);
                let extra = if spread > 0 {
                    rand::rng().random_range(0..spread)
                } else {
                    0
                };
                Duration::from_millis(floor.saturating_add(extra))
            }
        }
    }
}

#[inline]
fn exponential_ms(base_ms: u64, max_ms: u64, attempts: u32) -> u64 {
    let factor = 1u64.checked_shl(attempts.min(63)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

#[inline]
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
