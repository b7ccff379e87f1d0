//! Bounded exponential backoff for transport reconnects.
//!
//! Delay before retry `n` (1-based) is
//! `min(initial * multiplier^(n-1), max_delay)`, optionally scaled down by a
//! random jitter factor so a fleet of workers does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Retries after the first failed try. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay that may be shaved off at random (0.0..=1.0).
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Fail on the first error.
    pub const NONE: BackoffPolicy = BackoffPolicy {
        max_retries: 0,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        multiplier: 1.0,
        jitter: 0.0,
    };

    /// Ten retries from 1s doubling up to 30s.
    pub const STANDARD: BackoffPolicy = BackoffPolicy {
        max_retries: 10,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
        jitter: 0.2,
    };

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Deterministic delay before retry `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = self.initial_delay.as_secs_f64() * exp;
        if secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Delay before retry `retry` with jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let shave = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        base.mul_f64(1.0 - shave)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}
