//! Reconnect delay calculation.
//!
//! `delay(attempt) = min(base * 2^attempt + jitter, max)` where `jitter` is
//! drawn uniformly from `[0, jitter_max]`. The cap applies after jitter is
//! added, so no delay ever exceeds `max`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default first-retry delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default delay ceiling in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default upper bound for random jitter in milliseconds.
pub const DEFAULT_JITTER_MS: u64 = 1_000;

/// Backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Ceiling applied after jitter.
    pub max_delay_ms: u64,
    /// Jitter is drawn from `[0, jitter_ms]`.
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

impl BackoffPolicy {
    /// Delay for a zero-based `attempt` with a random jitter draw.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        Duration::from_millis(calculate_delay_ms(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            jitter,
        ))
    }
}

/// Deterministic delay for a zero-based `attempt` and an explicit jitter.
#[must_use]
pub fn calculate_delay_ms(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ms: u64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(63));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}
