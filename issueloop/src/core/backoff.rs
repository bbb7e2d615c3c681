//! Backoff schedules. Pure functions of the attempt/streak counters.

use std::time::Duration;

/// Upper bound shared by both schedules, in seconds.
pub const BACKOFF_CAP_SECS: u64 = 300;

/// Floor for the permission-error schedule, in seconds.
pub const PERMISSION_BACKOFF_FLOOR_SECS: u64 = 5;

/// Wait before retrying agent attempt `attempt + 1` after attempt `attempt` failed.
///
/// `min(300, base * 2^(attempt-1))`; `base == 0` disables backoff.
pub fn codex_backoff(base_secs: u64, attempt: u32) -> Duration {
    if base_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(doubling(base_secs, attempt))
}

/// Wait after the `streak`-th consecutive permission-like processing error.
pub fn permission_backoff(streak: u32) -> Duration {
    Duration::from_secs(doubling(PERMISSION_BACKOFF_FLOOR_SECS, streak))
}

fn doubling(base_secs: u64, step: u32) -> u64 {
    let exponent = step.saturating_sub(1).min(32);
    base_secs
        .saturating_mul(1u64 << exponent)
        .min(BACKOFF_CAP_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_backoff_doubles_from_base() {
        let waits: Vec<u64> = (1..=3).map(|a| codex_backoff(10, a).as_secs()).collect();
        assert_eq!(waits, vec![10, 20, 40]);
    }

    #[test]
    fn codex_backoff_caps_at_300() {
        assert_eq!(codex_backoff(10, 10).as_secs(), 300);
        assert_eq!(codex_backoff(10, 200).as_secs(), 300);
        assert_eq!(codex_backoff(300, 1).as_secs(), 300);
        assert_eq!(codex_backoff(1000, 1).as_secs(), 300);
    }

    #[test]
    fn zero_base_disables_backoff() {
        assert_eq!(codex_backoff(0, 5), Duration::ZERO);
    }

    #[test]
    fn permission_backoff_has_floor_and_cap() {
        assert_eq!(permission_backoff(0).as_secs(), 5);
        assert_eq!(permission_backoff(1).as_secs(), 5);
        assert_eq!(permission_backoff(2).as_secs(), 10);
        assert_eq!(permission_backoff(4).as_secs(), 40);
        assert_eq!(permission_backoff(7).as_secs(), 300);
        assert_eq!(permission_backoff(u32::MAX).as_secs(), 300);
    }
}
