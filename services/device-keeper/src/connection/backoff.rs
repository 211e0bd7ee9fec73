//! Reconnect backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff: `min(max_delay, base * 2^min(attempt, cap_attempts))`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub cap_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            cap_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect `attempt` (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.cap_attempts).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay with uniform jitter in `[0, delay/3)` added
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt);
        let spread_ms = (delay.as_millis() / 3) as u64;
        if spread_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng.gen_range(0..spread_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_sequence() {
        let policy = BackoffPolicy::default();
        let secs: Vec<u64> = (0..7).map(|n| policy.base_delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 0..7 {
            let base = policy.base_delay(attempt);
            for _ in 0..200 {
                let actual = policy.delay(attempt);
                assert!(actual >= base, "attempt {attempt}: {actual:?} < {base:?}");
                assert!(actual < base + base / 3, "attempt {attempt}: {actual:?} too large");
            }
        }
    }

    #[test]
    fn test_large_attempts_saturate() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            cap_attempts: 40,
        };
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }
}
