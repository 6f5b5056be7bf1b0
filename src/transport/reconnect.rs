//! Bounded fixed-delay reconnection.

use crate::defaults;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
            delay: Duration::from_millis(defaults::RECONNECT_DELAY_MS),
        }
    }
}

/// Attempt counter for one connect cycle. Reset on every successful open.
#[derive(Debug)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, or `None` when no attempt remains.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.enabled || self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            max_attempts,
            delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_defaults() {
        let policy = ReconnectPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let mut tracker = ReconnectTracker::new(policy(3));
        for _ in 0..3 {
            assert_eq!(tracker.next_delay(), Some(Duration::from_millis(10)));
        }
        assert_eq!(tracker.next_delay(), None);
        assert_eq!(tracker.attempts(), 3);
    }

    #[test]
    fn test_open_resets_counter() {
        let mut tracker = ReconnectTracker::new(policy(3));
        assert!(tracker.next_delay().is_some());
        tracker.on_open();
        assert_eq!(tracker.attempts(), 0);
        // A fresh budget of three, not the two left over.
        assert!(tracker.next_delay().is_some());
        assert!(tracker.next_delay().is_some());
        assert!(tracker.next_delay().is_some());
        assert!(tracker.next_delay().is_none());
    }

    #[test]
    fn test_disabled_never_retries() {
        let mut tracker = ReconnectTracker::new(ReconnectPolicy {
            enabled: false,
            ..policy(3)
        });
        assert_eq!(tracker.next_delay(), None);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut tracker = ReconnectTracker::new(policy(0));
        assert_eq!(tracker.next_delay(), None);
    }
}
