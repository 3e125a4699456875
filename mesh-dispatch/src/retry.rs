//! Jittered exponential backoff.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for failed and timed-out jobs.
///
/// The delay for attempt `n` is `base · 2^n` jittered by ±20% and capped at
/// `max`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given bounds.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Returns the configured base delay.
    #[must_use]
    pub const fn base_delay(self) -> Duration {
        self.base_delay
    }

    /// Returns the configured cap.
    #[must_use]
    pub const fn max_delay(self) -> Duration {
        self.max_delay
    }

    /// Computes the jittered delay before retrying after `attempt` attempts.
    #[must_use]
    pub fn delay_for(self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);

        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        scaled.mul_f64(jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(2));

        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));

        let third = policy.delay_for(2);
        assert!(third >= Duration::from_millis(320) && third <= Duration::from_millis(480));

        assert!(policy.delay_for(20) <= Duration::from_secs(2));
    }
}
