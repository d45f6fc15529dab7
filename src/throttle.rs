//! Failure log throttling.
//!
//! A display without DDC/CI fails on every tick. Each failure is still emitted
//! as an event, but only the start of a streak (and every Nth failure after
//! it) is raised to `warn`:
//! - Warn on the first `burst` consecutive failures
//! - Then warn on every `every`th failure, log the rest at `debug`

use std::collections::HashMap;
use std::hash::Hash;

/// Decision from the throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDecision {
    /// Log at warn level.
    Warn,
    /// Log at debug level.
    Quiet,
}

/// Per-key streak counter for repeated failures.
#[derive(Debug)]
pub struct FailureThrottle<K> {
    burst: u32,
    every: u32,
    streaks: HashMap<K, u32>,
}

impl<K: Hash + Eq> FailureThrottle<K> {
    /// Create a throttle warning on the first `burst` failures, then every `every`th.
    pub fn new(burst: u32, every: u32) -> Self {
        Self {
            burst,
            every: every.max(1),
            streaks: HashMap::new(),
        }
    }

    /// Record a failure and decide how loudly to log it.
    ///
    /// Returns the decision and the length of the current streak.
    pub fn record_failure(&mut self, key: K) -> (LogDecision, u32) {
        let streak = self.streaks.entry(key).or_insert(0);
        *streak = streak.saturating_add(1);

        let decision = if *streak <= self.burst || *streak % self.every == 0 {
            LogDecision::Warn
        } else {
            LogDecision::Quiet
        };
        (decision, *streak)
    }

    /// Record a success, returning the length of the streak it ended, if any.
    pub fn record_success(&mut self, key: &K) -> Option<u32> {
        self.streaks.remove(key).filter(|n| *n > 0)
    }

    /// Forget a key entirely.
    pub fn forget(&mut self, key: &K) {
        self.streaks.remove(key);
    }
}

impl<K: Hash + Eq> Default for FailureThrottle<K> {
    fn default() -> Self {
        Self::new(3, 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failures_warn() {
        let mut throttle = FailureThrottle::new(2, 10);
        assert_eq!(throttle.record_failure("a"), (LogDecision::Warn, 1));
        assert_eq!(throttle.record_failure("a"), (LogDecision::Warn, 2));
        assert_eq!(throttle.record_failure("a"), (LogDecision::Quiet, 3));
    }

    #[test]
    fn test_periodic_warn_after_burst() {
        let mut throttle = FailureThrottle::new(1, 5);
        let decisions: Vec<_> = (0..10).map(|_| throttle.record_failure("a").0).collect();

        assert_eq!(decisions[0], LogDecision::Warn);
        assert_eq!(decisions[4], LogDecision::Warn);
        assert_eq!(decisions[9], LogDecision::Warn);
        assert_eq!(decisions[5], LogDecision::Quiet);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut throttle = FailureThrottle::new(1, 100);
        throttle.record_failure("a");
        assert_eq!(throttle.record_failure("a").0, LogDecision::Quiet);
        assert_eq!(throttle.record_failure("b").0, LogDecision::Warn);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut throttle = FailureThrottle::new(1, 100);
        throttle.record_failure("a");
        throttle.record_failure("a");

        assert_eq!(throttle.record_success(&"a"), Some(2));
        assert_eq!(throttle.record_success(&"a"), None);
        assert_eq!(throttle.record_failure("a"), (LogDecision::Warn, 1));
    }
}
