//! Retry, backoff and auth-mode escalation rules of the forwarding loop.
//!
//! Pure functions only, so the rules are testable without spawning anything.

use std::time::Duration;

use spacewatch_core::config::RelayConfig;

use crate::fetcher::AuthMode;

/// Backoff timings between fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts that end sooner than this are fast failures.
    pub fast_fail_window: Duration,
    /// Delay after a fast failure.
    pub fast_fail_delay: Duration,
    /// Delay after any other attempt.
    pub steady_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            fast_fail_window: Duration::from_secs(5),
            fast_fail_delay: Duration::from_secs(2),
            steady_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub const fn from_config(config: &RelayConfig) -> Self {
        Self {
            fast_fail_window: Duration::from_millis(config.fast_fail_window_ms),
            fast_fail_delay: Duration::from_millis(config.fast_fail_delay_ms),
            steady_delay: Duration::from_millis(config.steady_delay_ms),
        }
    }

    pub fn is_fast_fail(&self, elapsed: Duration) -> bool {
        elapsed < self.fast_fail_window
    }

    /// Sleep before the next attempt.
    pub const fn next_delay(&self, fast_fail: bool) -> Duration {
        if fast_fail {
            self.fast_fail_delay
        } else {
            self.steady_delay
        }
    }
}

/// Mode index for the next attempt.
///
/// Advances by exactly one on a fast failure while candidates remain; never
/// skips, wraps or goes back.
pub const fn next_mode_index(current: usize, fast_fail: bool, candidate_count: usize) -> usize {
    if fast_fail && current + 1 < candidate_count {
        current + 1
    } else {
        current
    }
}

/// Mode for `index`, clamped to the last candidate. `Guest` when there are none.
pub fn select_mode(modes: &[AuthMode], index: usize) -> AuthMode {
    modes
        .get(index.min(modes.len().saturating_sub(1)))
        .copied()
        .unwrap_or(AuthMode::Guest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(true), Duration::from_secs(2));
        assert_eq!(policy.next_delay(false), Duration::from_secs(1));
        assert!(policy.is_fast_fail(Duration::from_millis(4_999)));
        assert!(!policy.is_fast_fail(Duration::from_secs(5)));
    }

    #[test]
    fn from_config_uses_milliseconds() {
        let config = RelayConfig {
            fast_fail_window_ms: 250,
            fast_fail_delay_ms: 40,
            steady_delay_ms: 10,
            ..RelayConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.fast_fail_window, Duration::from_millis(250));
        assert_eq!(policy.next_delay(true), Duration::from_millis(40));
        assert_eq!(policy.next_delay(false), Duration::from_millis(10));
    }

    #[test]
    fn fast_fail_escalates_by_exactly_one() {
        assert_eq!(next_mode_index(0, true, 2), 1);
        assert_eq!(next_mode_index(0, true, 3), 1);
        assert_eq!(next_mode_index(1, true, 3), 2);
    }

    #[test]
    fn escalation_stops_at_last_candidate() {
        assert_eq!(next_mode_index(1, true, 2), 1);
        assert_eq!(next_mode_index(0, true, 1), 0);
        assert_eq!(next_mode_index(0, true, 0), 0);
    }

    #[test]
    fn slow_attempt_keeps_mode() {
        assert_eq!(next_mode_index(0, false, 2), 0);
        assert_eq!(next_mode_index(1, false, 2), 1);
    }

    #[test]
    fn index_never_decreases_over_a_session() {
        let pattern = [true, false, true, true, false, true, true];
        let mut index = 0;
        for fast in pattern {
            let next = next_mode_index(index, fast, 3);
            assert!(next >= index && next <= index + 1);
            index = next;
        }
        assert_eq!(index, 2);
    }

    #[test]
    fn select_mode_clamps_and_defaults() {
        let modes = [AuthMode::Guest, AuthMode::Authenticated];
        assert_eq!(select_mode(&modes, 0), AuthMode::Guest);
        assert_eq!(select_mode(&modes, 1), AuthMode::Authenticated);
        assert_eq!(select_mode(&modes, 7), AuthMode::Authenticated);
        assert_eq!(select_mode(&[], 0), AuthMode::Guest);
    }
}
