//! # Fibonacci Backoff
//!
//! Provides a Fibonacci-based backoff mechanism for retrying failed
//! reconciliations. It grows more slowly than exponential backoff, so a
//! resource stuck on a hard error keeps being retried at a useful cadence.
//!
//! ## Usage
//!
//! ```rust
//! use riff_system::controller::backoff::FibonacciBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = FibonacciBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(15));
//! ```

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    prev: Duration,
    current: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff
    ///
    /// `min` is used for the first two values; `max` caps the sequence.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = next.min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min.min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(MINUTE, MINUTE * 10);

        // 1m, 1m, 2m, 3m, 5m, 8m, 10m (max)
        for expected in [1, 1, 2, 3, 5, 8, 10, 10, 10] {
            assert_eq!(backoff.next_backoff(), MINUTE * expected);
        }
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(MINUTE, MINUTE * 10);
        for _ in 0..4 {
            backoff.next_backoff();
        }

        backoff.reset();

        // Should restart from beginning after success
        assert_eq!(backoff.next_backoff(), MINUTE);
        assert_eq!(backoff.next_backoff(), MINUTE);
        assert_eq!(backoff.next_backoff(), MINUTE * 2);
    }

    #[test]
    fn test_min_above_max_is_capped() {
        let mut backoff = FibonacciBackoff::new(MINUTE * 20, MINUTE * 10);
        assert_eq!(backoff.next_backoff(), MINUTE * 10);
        assert_eq!(backoff.next_backoff(), MINUTE * 10);
    }

    #[test]
    fn test_fibonacci_backoff_per_resource_state() {
        let mut backoff1 = FibonacciBackoff::new(MINUTE, MINUTE * 10);
        let mut backoff2 = FibonacciBackoff::new(MINUTE, MINUTE * 10);

        for _ in 0..5 {
            backoff1.next_backoff();
        }
        assert_eq!(backoff2.next_backoff(), MINUTE);

        backoff1.reset();
        assert_eq!(backoff1.next_backoff(), MINUTE);
        assert_eq!(backoff2.next_backoff(), MINUTE);
        assert_eq!(backoff2.next_backoff(), MINUTE * 2);
    }
}
