//! Retry policy: bounded attempts, exponential backoff with jitter.

use std::time::Duration;

use runtime::config::QueueConfig;

use crate::cancel::is_cancellation;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.retry_base_ms),
            Duration::from_millis(cfg.retry_max_ms),
        )
    }

    /// Whether a failed attempt is re-enqueued. Cancellations are never
    /// retried; everything else retries while budget remains.
    pub fn should_retry(&self, err: &anyhow::Error, attempt: u32, max_retries: u32) -> bool {
        attempt < max_retries && !is_cancellation(err)
    }

    /// `base * 2^attempt`, jittered upward by at most 25%, capped.
    ///
    /// The jitter window is smaller than the doubling factor, so delays
    /// grow strictly across attempts until the cap is hit.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.max);
        let jittered = capped.mul_f64(1.0 + jitter_factor());
        jittered.min(self.max)
    }
}

fn jitter_factor() -> f64 {
    use rand::Rng;
    rand::rng().random_range(0.0..0.25)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crate::error::TaggedError;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(1_000))
    }

    #[test]
    fn retries_until_budget_is_spent() {
        let p = policy();
        let err = anyhow!("backend 500");
        assert!(p.should_retry(&err, 0, 3));
        assert!(p.should_retry(&err, 2, 3));
        assert!(!p.should_retry(&err, 3, 3));
        assert!(!p.should_retry(&err, 0, 0));
    }

    #[test]
    fn cancellations_are_never_retried() {
        let p = policy();
        let err = anyhow::Error::new(TaggedError::new("stop").with_code("CANCELLED"));
        assert!(!p.should_retry(&err, 0, 5));
    }

    #[test]
    fn backoff_grows_monotonically_until_the_cap() {
        let p = policy();
        let d0 = p.backoff_delay(0);
        let d1 = p.backoff_delay(1);
        let d2 = p.backoff_delay(2);

        // Jitter (< +25%) never outweighs the doubling.
        assert!(d1 > d0, "{d1:?} must exceed {d0:?}");
        assert!(d2 > d1, "{d2:?} must exceed {d1:?}");
    }

    #[test]
    fn backoff_is_bounded_by_base_and_cap() {
        let p = policy();
        let d = p.backoff_delay(0);
        assert!(d >= Duration::from_millis(10));
        assert!(d < Duration::from_millis(13));

        // Far past the cap, always exactly the cap.
        assert!(p.backoff_delay(30) <= Duration::from_millis(1_000));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let p = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(p.backoff_delay(u32::MAX), Duration::from_secs(60));
    }
}
