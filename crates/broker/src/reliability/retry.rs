//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_util::duration_millis;

/// Exponential backoff with jitter and an attempt ceiling
///
/// The policy is a pure function of its inputs: given the same attempt
/// number and the same random source it always produces the same delay.
///
/// # Example
///
/// ```
/// use deferq_broker::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_secs(1))
///     .with_backoff_multiplier(5.0)
///     .with_jitter_fraction(0.0);
///
/// assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
/// assert_eq!(policy.backoff_delay(2), Duration::from_secs(5));
/// assert_eq!(policy.backoff_delay(3), Duration::from_secs(25));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of failures that are rescheduled before a task is dead-lettered
    pub max_attempts: u32,

    /// Delay after the first failure
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,

    /// Growth factor applied per failed attempt
    pub backoff_multiplier: f64,

    /// Upper bound on the un-jittered delay
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter_fraction: f64,
}

/// What to do with a task whose attempt just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the task visible again after `delay`
    Retry { delay: Duration },

    /// No attempts left; route to the dead-letter queue
    Exhausted,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second base delay
    /// - 60 second max delay
    /// - 2x backoff multiplier
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }

    /// Create a policy with fixed delays (no growth, no jitter)
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter_fraction: 0.0,
        }
    }

    /// Set the attempt ceiling
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first retry delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum retry delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (clamped to 0.0-1.0)
    pub fn with_jitter_fraction(mut self, jitter: f64) -> Self {
        self.jitter_fraction = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay after the failure of claim number `attempt` (1-based)
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if raw.is_nan() {
            return Duration::ZERO;
        }
        let capped = raw.min(self.max_delay.as_secs_f64());

        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Spread `delay` uniformly over `[delay - j*delay, delay + j*delay]`
    pub fn apply_jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter_fraction <= 0.0 || delay.is_zero() {
            return delay;
        }

        let secs = delay.as_secs_f64();
        let range = secs * self.jitter_fraction;
        let offset = rng.gen_range(-range..=range);

        Duration::try_from_secs_f64((secs + offset).max(0.0)).unwrap_or(delay)
    }

    /// Decide the fate of a task whose claim number `attempt` failed
    ///
    /// Failures are rescheduled while `attempt <= max_attempts`; the first
    /// failure beyond that is permanent.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        max_attempts: u32,
        rng: &mut R,
    ) -> RetryDecision {
        if !self.has_attempts_remaining(attempt, max_attempts) {
            return RetryDecision::Exhausted;
        }

        let delay = self.apply_jitter(self.backoff_delay(attempt), rng);
        RetryDecision::Retry { delay }
    }

    /// Check whether a failure on claim number `attempt` may be retried
    pub fn has_attempts_remaining(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt <= max_attempts
    }

    /// Check the policy for values that make no sense
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err("jitter_fraction must be within 0.0..=1.0".into());
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay".into());
        }
        Ok(())
    }
}
