use rand::Rng;
use std::time::Duration;

use crate::pipeline::error::FetchError;

/// Bounded retry decisions with capped exponential backoff.
///
/// Fetch and inference share the policy but carry independent attempt limits.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_fetch_attempts: u32,
    pub max_infer_attempts: u32,
    pub base_delay: Duration,
    pub delay_ceiling: Duration,
    /// Multiplier applied to the backoff of rate-limited fetches.
    pub rate_limit_factor: u32,
    /// Randomise each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// True iff another attempt is allowed after `attempt_count` attempts.
    pub fn should_retry(attempt_count: u32, max_attempts: u32) -> bool {
        attempt_count < max_attempts
    }

    /// `base_delay * 2^(attempt_count - 1)`, capped at the ceiling.
    pub fn backoff_delay(&self, attempt_count: u32, base_delay: Duration) -> Duration {
        let exponent = attempt_count.max(1) - 1;
        let factor = 2u32.saturating_pow(exponent);
        let delay = base_delay.saturating_mul(factor).min(self.delay_ceiling);
        self.apply_jitter(delay)
    }

    /// Delay before retrying a failed fetch.
    ///
    /// Rate-limited failures back off longer and never retry before the
    /// source's own hint, but still respect the ceiling.
    pub fn fetch_delay(&self, attempt_count: u32, error: &FetchError) -> Duration {
        match error {
            FetchError::RateLimited { retry_after } => {
                let base = self.base_delay.saturating_mul(self.rate_limit_factor.max(1));
                let delay = self.backoff_delay(attempt_count, base);
                retry_after
                    .map(|hint| delay.max(hint))
                    .unwrap_or(delay)
                    .min(self.delay_ceiling)
            }
            _ => self.backoff_delay(attempt_count, self.base_delay),
        }
    }

    pub fn inference_delay(&self, attempt_count: u32) -> Duration {
        self.backoff_delay(attempt_count, self.base_delay)
    }

    pub fn retry_fetch(&self, attempt_count: u32) -> bool {
        Self::should_retry(attempt_count, self.max_fetch_attempts)
    }

    pub fn retry_inference(&self, attempt_count: u32) -> bool {
        Self::should_retry(attempt_count, self.max_infer_attempts)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let low = delay / 2;
        rand::thread_rng().gen_range(low..=delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_fetch_attempts: 3,
            max_infer_attempts: 3,
            base_delay: Duration::from_secs(5),
            delay_ceiling: Duration::from_secs(60),
            rate_limit_factor: 4,
            jitter: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_fetch_attempts: 3,
            max_infer_attempts: 2,
            base_delay: Duration::from_millis(100),
            delay_ceiling: Duration::from_secs(1),
            rate_limit_factor: 4,
            jitter: false,
        }
    }

    #[test]
    fn test_should_retry_until_limit() {
        assert!(RetryPolicy::should_retry(0, 3));
        assert!(RetryPolicy::should_retry(2, 3));
        assert!(!RetryPolicy::should_retry(3, 3));
        assert!(!RetryPolicy::should_retry(4, 3));
    }

    #[test]
    fn test_independent_stage_limits() {
        let p = policy();
        assert!(p.retry_fetch(2));
        assert!(!p.retry_inference(2));
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy();
        let base = p.base_delay;
        assert_eq!(p.backoff_delay(1, base), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2, base), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3, base), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped_at_ceiling() {
        let p = policy();
        assert_eq!(p.backoff_delay(5, p.base_delay), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(200, p.base_delay), Duration::from_secs(1));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let p = policy();
        assert_eq!(p.backoff_delay(0, p.base_delay), Duration::from_millis(100));
    }

    #[test]
    fn test_rate_limited_backs_off_longer() {
        let p = policy();
        let transient = p.fetch_delay(1, &FetchError::TransientNetwork("reset".into()));
        let limited = p.fetch_delay(1, &FetchError::RateLimited { retry_after: None });
        assert_eq!(transient, Duration::from_millis(100));
        assert_eq!(limited, Duration::from_millis(400));
    }

    #[test]
    fn test_rate_limit_hint_honoured_but_capped() {
        let p = policy();
        let hinted = p.fetch_delay(
            1,
            &FetchError::RateLimited {
                retry_after: Some(Duration::from_millis(700)),
            },
        );
        assert_eq!(hinted, Duration::from_millis(700));

        let huge = p.fetch_delay(
            1,
            &FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            },
        );
        assert_eq!(huge, Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut p = policy();
        p.jitter = true;
        for _ in 0..100 {
            let d = p.backoff_delay(2, p.base_delay);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }
}
