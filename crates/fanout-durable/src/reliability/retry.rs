//! Retry ceiling for transient blob failures

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration_millis;

/// How often, and how far apart, a failing blob task is re-run
///
/// `max_attempts` counts the first run, so the default of four allows three
/// retries. Delays double from `base_delay` and are spread by `jitter` so that
/// children failing together do not come back together.
///
/// ```
/// use fanout_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_retries(5)
///     .with_base_delay(Duration::from_millis(500))
///     .with_jitter(0.0);
///
/// assert!(policy.allows_retry(4));
/// assert!(!policy.allows_retry(5));
/// assert_eq!(policy.delay_before_retry(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Runs allowed in total, first run included
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor per retry
    pub multiplier: f64,

    /// Fraction of the delay randomly added or removed (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Retries allowed after the first run by default
    pub const DEFAULT_RETRY_CEILING: u32 = 3;

    /// Three retries, 1s doubling up to 60s, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: Self::DEFAULT_RETRY_CEILING + 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Constant delay between runs
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Fail on the first error
    pub fn never() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Allow `retries` runs after the first one
    pub fn with_retries(self, retries: u32) -> Self {
        self.with_max_attempts(retries.saturating_add(1))
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether a task that already used `retries_done` retries may run again
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done.saturating_add(1) < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let delay = (self.base_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        if delay <= 0.0 || self.jitter <= 0.0 {
            return Duration::from_secs_f64(delay.max(0.0));
        }

        let spread = delay * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ceiling_is_three_retries() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 4);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_never_retries() {
        assert!(!RetryPolicy::never().allows_retry(0));
        assert_eq!(RetryPolicy::fixed(Duration::ZERO, 0).max_attempts, 1);
    }

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(0.0);

        let delays: Vec<_> = (1..=5).map(|r| policy.delay_before_retry(r)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);

        for _ in 0..50 {
            let delay = policy.delay_before_retry(2);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_zero_delay_ignores_jitter() {
        let policy = RetryPolicy::fixed(Duration::ZERO, 4).with_jitter(1.0);
        assert_eq!(policy.delay_before_retry(3), Duration::ZERO);
    }

    #[test]
    fn test_serializes_delays_as_millis() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();

        assert_eq!(json["base_delay"], 1000);
        assert_eq!(json["max_delay"], 60_000);
        assert_eq!(serde_json::from_value::<RetryPolicy>(json).unwrap(), RetryPolicy::default());
    }
}
