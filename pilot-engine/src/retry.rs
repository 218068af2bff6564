//! Retry scheduling with configurable backoff and jitter.
//!
//! Drives the job store's re-enqueue schedule: a failed job gets a
//! `next_retry_at` timestamp computed from its attempt counter, with
//! exponential backoff and jitter. The default jitter keeps the schedule
//! monotone: each retry delay is at least as long as the previous one.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Half fixed, half random. Preserves backoff monotonicity: the
    /// minimum jittered delay for attempt n+1 equals the maximum for
    /// attempt n under exponential backoff, and delays at the cap are
    /// exact rather than jittered.
    #[default]
    Equal,
    /// Random from 0 to delay. Not monotone; opt-in only.
    Full,
}

/// Retry policy for pipeline jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the initial run.
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Equal,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Returns true if another attempt is allowed after `attempt`
    /// completed attempts.
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Computes the delay before the retry following attempt `attempt`
    /// (1-indexed: the delay after the first failed attempt uses
    /// `attempt = 1`).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = match self.backoff {
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Constant => self.base_delay_ms,
        };
        let capped = raw.min(self.max_delay_ms);

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            // Once the raw backoff reaches the cap the delay is exact:
            // jittering inside [cap/2, cap] would let a later retry land
            // before an earlier one.
            JitterStrategy::Equal if raw >= self.max_delay_ms => capped,
            JitterStrategy::Equal => {
                let half = capped / 2;
                if half == 0 {
                    capped
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Full => {
                if capped == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=capped)
                }
            }
        };

        Duration::from_millis(jittered)
    }

    /// Computes the wall-clock time of the retry following attempt
    /// `attempt`, relative to `now`.
    #[must_use]
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt);
        now + ChronoDuration::milliseconds(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.jitter, JitterStrategy::Equal);
    }

    #[test]
    fn test_allows_retry_bound() {
        let policy = RetryPolicy::new().with_max_attempts(3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_exponential_no_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Exponential)
            .with_jitter(JitterStrategy::None);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_no_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);

        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_equal_jitter_is_monotone() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1_000_000)
            .with_jitter(JitterStrategy::Equal);

        // Worst case for attempt n (full jitter half) never exceeds the
        // best case for attempt n+1 under exponential doubling.
        for _ in 0..20 {
            let mut previous = Duration::ZERO;
            for attempt in 1..6 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(
                    delay >= previous,
                    "delay shrank: {previous:?} -> {delay:?} at attempt {attempt}"
                );
                previous = Duration::from_millis(100 * 2u64.pow(attempt - 1));
            }
        }
    }

    #[test]
    fn test_equal_jitter_monotone_through_the_cap() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(3000)
            .with_jitter(JitterStrategy::Equal);

        // Attempts 3+ exceed the cap and get the exact cap, so no later
        // draw can undercut an earlier one.
        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for attempt in 1..8 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(
                    delay >= previous,
                    "delay shrank: {previous:?} -> {delay:?} at attempt {attempt}"
                );
                previous = delay;
            }
            assert_eq!(previous, Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);

        for _ in 0..10 {
            assert!(policy.delay_for_attempt(1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_next_retry_at_in_future() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(500)
            .with_jitter(JitterStrategy::None);
        let now = Utc::now();
        let at = policy.next_retry_at(now, 1);
        assert_eq!((at - now).num_milliseconds(), 500);
    }
}
