//! # Retry Backoff
//!
//! Exponential backoff shared by message redelivery and step retries:
//! `delay = min(base_delay * factor^retry_count, max_delay)`, optionally jittered.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Maximum jitter as a fraction of the computed delay (0.1 = ±10%)
    pub jitter: Option<f64>,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            factor,
            max_delay,
            jitter: None,
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = (fraction > 0.0).then_some(fraction.min(1.0));
        self
    }

    /// Deterministic delay before retry number `retry_count + 1`
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let multiplier = self.factor.max(1.0).powi(exponent);
        let millis = self.base_delay.as_secs_f64() * 1000.0 * multiplier;
        let max_millis = self.max_delay.as_secs_f64() * 1000.0;

        if !millis.is_finite() || millis >= max_millis {
            self.max_delay
        } else {
            Duration::from_secs_f64(millis / 1000.0)
        }
    }

    /// Delay with jitter applied, never above `max_delay`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);
        match self.jitter {
            Some(fraction) => {
                let offset = (fastrand::f64() * 2.0 - 1.0) * fraction;
                delay.mul_f64((1.0 + offset).max(0.0)).min(self.max_delay)
            }
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_millis(500));
        assert_eq!(policy.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.base_delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), 2.0, Duration::from_secs(60))
            .with_jitter(0.1);
        for _ in 0..100 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(899), "{delay:?}");
            assert!(delay <= Duration::from_millis(1101), "{delay:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_backoff_is_non_decreasing_and_capped(
            base_ms in 1u64..5_000,
            factor in 1.0f64..4.0,
            max_ms in 1u64..120_000,
            retries in 0u32..64,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                factor,
                Duration::from_millis(max_ms),
            );
            let max = Duration::from_millis(max_ms);
            let mut previous = Duration::ZERO;
            for retry in 0..retries {
                let delay = policy.base_delay_for(retry);
                prop_assert!(delay <= max);
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
