//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Processor invocations allowed per execution (including the first).
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound applied after the multiplier (before jitter).
    pub max_delay: Duration,

    /// Relative jitter in `[0, 1)`. 0.1 means +-10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts already made.
    ///
    /// `delay = base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - after attempt 1: 1s
    /// - after attempt 2: 2s
    /// - after attempt 3: 4s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };

        let secs = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + factor)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Longest sleep `next_delay` can return: the cap stretched by jitter.
    pub fn longest_delay(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter.max(0.0))
    }

    pub fn has_budget(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
