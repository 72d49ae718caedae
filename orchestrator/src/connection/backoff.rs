use std::time::Duration;

use rand::Rng;

/// How hard the connection manager tries to reach a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, the first one included. At least 1 is always made.
    pub attempts: u32,
    /// The ceiling of the delay before the second attempt.
    pub base_delay: Duration,
    /// No delay ceiling grows past this.
    pub max_delay: Duration,
    /// Bound on opening the transport and shaking hands.
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// The delay ceiling after `retry` failed attempts, doubling from `base_delay`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A uniformly random delay in `[0, ceiling(retry)]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry).as_micros() as u64;

        if ceiling == 0 {
            return Duration::ZERO;
        }

        Duration::from_micros(rand::rng().random_range(0..=ceiling))
    }
}
