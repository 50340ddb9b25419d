//! Exponential backoff as explicit delay tokens
//!
//! Delays are computed from `retry_count` and turned into a `next_attempt_at`
//! instant; nothing here sleeps.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Cap on the exponent to avoid overflow
const MAX_BACKOFF_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

/// What happens to an item after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, not dispatched before `next_attempt_at`.
    Reschedule { retry_count: u32, next_attempt_at: DateTime<Utc> },
    /// Attempts used up; dead-letter.
    Exhausted { retry_count: u32 },
}

impl BackoffPolicy {
    /// `max` is raised to `base` if smaller.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    /// `base * 2^retry_count`, saturating at `max`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_millis = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);

        let exponent = retry_count.min(MAX_BACKOFF_EXPONENT);
        let multiplier = 2_u64.saturating_pow(exponent);
        Duration::from_millis(base_millis.saturating_mul(multiplier).min(max_millis))
    }

    /// Decide the fate of an item that just failed its attempt with
    /// `retry_count` previous failures.
    ///
    /// The failed attempt is counted first; once the count reaches
    /// `max_retries` the item is exhausted. An item therefore gets exactly
    /// `max(max_retries, 1)` attempts, and `max_retries = 0` fails on the
    /// first one.
    pub fn decide(&self, retry_count: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        let retry_count = retry_count.saturating_add(1);
        if retry_count >= max_retries {
            return RetryDecision::Exhausted { retry_count };
        }

        let delay = chrono::Duration::from_std(self.delay_for(retry_count - 1))
            .unwrap_or(chrono::Duration::MAX);
        let next_attempt_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Reschedule { retry_count, next_attempt_at }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000))
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn reschedules_until_the_ceiling() {
        let policy = policy();
        let now = Utc::now();

        let first = policy.decide(0, 3, now);
        assert_eq!(
            first,
            RetryDecision::Reschedule {
                retry_count: 1,
                next_attempt_at: now + chrono::Duration::milliseconds(100)
            }
        );

        let second = policy.decide(1, 3, now);
        assert!(matches!(
            second,
            RetryDecision::Reschedule { retry_count: 2, next_attempt_at } if next_attempt_at == now + chrono::Duration::milliseconds(200)
        ));

        assert_eq!(policy.decide(2, 3, now), RetryDecision::Exhausted { retry_count: 3 });
    }

    #[test]
    fn zero_max_retries_exhausts_immediately() {
        assert_eq!(policy().decide(0, 0, Utc::now()), RetryDecision::Exhausted { retry_count: 1 });
    }

    #[test]
    fn max_is_never_below_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
    }
}
