//! Busy-wait detection and self-heal eligibility.
//!
//! A busy-wait is an idle loop while the queue still holds work. Detection
//! and eligibility are pure; the heal itself lives in `self_heal`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REASON_DISABLED: &str = "self_heal_disabled";
pub const REASON_MAX_ATTEMPTS: &str = "self_heal_max_attempts_reached";
pub const REASON_COOLDOWN: &str = "self_heal_cooldown_active";

/// Persisted busy-wait bookkeeping (`state/busy_wait.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusyWaitState {
    pub last_detected_at: Option<DateTime<Utc>>,
    pub last_self_heal_at: Option<DateTime<Utc>>,
    pub self_heal_attempts: u32,
    pub last_self_heal_result: Option<String>,
    pub last_self_heal_error: Option<String>,
    pub last_recovered_count: usize,
    pub last_ready_after: usize,
    pub last_idle_count: u64,
}

/// Queue counts sampled on an idle iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub ready: usize,
    pub in_progress: usize,
}

impl QueueCounts {
    pub fn has_work(&self) -> bool {
        self.ready > 0 || self.in_progress > 0
    }
}

/// Whether an idle iteration should be reported as a busy-wait.
pub fn should_detect(is_owner: bool, idle_count: u64, threshold: u64, counts: QueueCounts) -> bool {
    is_owner && threshold > 0 && idle_count > 0 && idle_count % threshold == 0 && counts.has_work()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfHealPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub cooldown: chrono::Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Allowed,
    Denied {
        reason: &'static str,
        /// Seconds until the cooldown expires (cooldown denials only).
        remaining_secs: Option<i64>,
    },
}

/// Check the three independent self-heal gates; the first failing one wins.
pub fn eligibility(policy: &SelfHealPolicy, state: &BusyWaitState, now: DateTime<Utc>) -> Eligibility {
    if !policy.enabled {
        return Eligibility::Denied {
            reason: REASON_DISABLED,
            remaining_secs: None,
        };
    }
    if policy.max_attempts > 0 && state.self_heal_attempts >= policy.max_attempts {
        return Eligibility::Denied {
            reason: REASON_MAX_ATTEMPTS,
            remaining_secs: None,
        };
    }
    if let Some(last) = state.last_self_heal_at {
        let elapsed = now - last;
        if elapsed < policy.cooldown {
            let remaining = (policy.cooldown - elapsed).num_seconds().max(1);
            return Eligibility::Denied {
                reason: REASON_COOLDOWN,
                remaining_secs: Some(remaining),
            };
        }
    }
    Eligibility::Allowed
}
