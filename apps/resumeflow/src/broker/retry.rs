//! Retry policy: capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Ceiling for any single delay.
    pub max_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-indexed):
    /// `base_delay * multiplier^(retry - 1)`, capped at `max_delay`.
    ///
    /// With base_delay=2s, multiplier=2.0, max_delay=60s:
    /// - retry 1: 2s
    /// - retry 2: 4s
    /// - retry 3: 8s
    /// - retry 6: 60s (capped)
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// `next_delay` with "equal jitter": half fixed, half uniformly random.
    /// Spreads retries of tasks that failed together.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.next_delay(retry);
        let half = delay / 2;
        if half.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(0.0..=1.0);
        half + half.mul_f64(spread)
    }
}
