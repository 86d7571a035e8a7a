//! Reconnect delay for the event channel
//!
//! The delay doubles after every abnormal close and is clamped to `max`.
//! Only a successful open brings it back to `base`.
//!
//! ```text
//! 500 → 1000 → 2000 → 4000 → 8000 → 10000 → 10000 ...
//! ```

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    /// `max` below `base` is raised to `base`
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait before the next attempt
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Double the delay, clamped to the cap
    pub fn advance(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    /// Back to base after a successful open
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(10_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_clamps() {
        let mut backoff = ReconnectBackoff::default();
        let mut delays = Vec::new();
        for _ in 0..7 {
            delays.push(backoff.current().as_millis());
            backoff.advance();
        }
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 10000, 10000]);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = ReconnectBackoff::default();
        backoff.advance();
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(2000));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(500));
    }

    #[test]
    fn test_max_below_base() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(800), Duration::from_millis(100));
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(800));
    }
}
