//! Backoff strategies used by `foreman-core` to cool down latent
//! workers that failed to substantiate, and more generally anywhere a
//! caller needs a jittered delay sequence rather than a single fixed
//! interval.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// The shape of a backoff curve. Mirrors the handful of strategies
/// operators actually reach for: a flat cooldown, a linearly growing
/// one, or an exponential one with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Constant {
        delay_ms: u64,
    },
    Linear {
        increment_ms: u64,
        max_ms: u64,
    },
    Exponential {
        base_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_ms: 1_000,
            multiplier: 2.0,
            max_ms: 15 * 60 * 1_000,
        }
    }
}

/// How much random jitter to apply on top of the computed delay, as a
/// fraction of the delay (`0.0` disables jitter).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterConfig {
    pub ratio: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self { ratio: 0.1 }
    }
}

/// A complete quarantine/retry policy: the curve plus jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub jitter: JitterConfig,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            jitter: JitterConfig::default(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the `attempt`-th retry/quarantine cycle (1-indexed:
    /// `attempt == 1` is the delay after the first failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = calculate_delay(self.strategy, attempt);
        apply_jitter(base, self.jitter.ratio)
    }
}

/// Compute the unjittered delay for a given attempt number under a
/// strategy. `attempt` is 1-indexed.
pub fn calculate_delay(strategy: BackoffStrategy, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    match strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Constant { delay_ms } => Duration::from_millis(delay_ms),
        BackoffStrategy::Linear {
            increment_ms,
            max_ms,
        } => {
            let ms = increment_ms.saturating_mul(attempt as u64).min(max_ms);
            Duration::from_millis(ms)
        }
        BackoffStrategy::Exponential {
            base_ms,
            multiplier,
            max_ms,
        } => {
            let factor = multiplier.powi((attempt - 1) as i32);
            let ms = (base_ms as f64 * factor).min(max_ms as f64).max(0.0);
            Duration::from_millis(ms as u64)
        }
    }
}

/// Apply symmetric jitter of `ratio` (e.g. `0.1` = +/-10%) to a delay.
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return delay;
    }
    let ratio = ratio.min(1.0);
    let millis = delay.as_millis() as f64;
    let spread = millis * ratio;
    let jittered = rand::rng().random_range((millis - spread).max(0.0)..=(millis + spread));
    Duration::from_millis(jittered as u64)
}

/// Tracks the attempt count and current cooldown window for one
/// quarantined entity (a latent worker). Not thread-safe on its own —
/// callers own the surrounding mutex/actor.
#[derive(Debug, Clone, Default)]
pub struct QuarantineTracker {
    policy: BackoffPolicy,
    attempt: u32,
}

impl QuarantineTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Record a failure and return how long the cooldown should last.
    pub fn record_failure(&mut self) -> Duration {
        self.attempt += 1;
        self.policy.delay_for(self.attempt)
    }

    /// Clear the cooldown after a successful, non-RETRY, non-EXCEPTION
    /// outcome.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
