//! Exponential backoff for the polling trigger source.
//!
//! When a scan of the shared database fails (usually a busy or locked
//! file), the poller waits before trying again: 100ms, 200ms, 400ms,
//! 800ms, 1600ms, then 3s until a scan succeeds.

use std::time::Duration;

/// Doubling delay with a cap.
///
/// ```
/// use murmur::backoff::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new();
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// backoff.reset();
/// assert_eq!(backoff.failures(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Consecutive failures since the last reset
    failures: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    const DEFAULT_BASE: Duration = Duration::from_millis(100);
    const DEFAULT_MAX: Duration = Duration::from_secs(3);

    pub fn new() -> Self {
        Self::with_config(Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }

    pub fn with_config(base: Duration, max: Duration) -> Self {
        Self {
            failures: 0,
            base,
            max,
        }
    }

    /// Delay before the next attempt; counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Call after a successful scan
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// min(base * 2^failures, max), without advancing
    pub fn current_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_caps_at_max() {
        let mut backoff = Backoff::new();
        let delays: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3000, 3000]);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::with_config(Duration::from_millis(10), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_no_overflow_after_many_failures() {
        let mut backoff = Backoff::new();
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_secs(3));
        }
    }
}
