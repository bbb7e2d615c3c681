//! Busy-wait state (`state/busy_wait.json`) and event log
//! (`logs/busy_wait_events.jsonl`).

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::busy_wait::{BusyWaitState, QueueCounts};
use crate::io::store::write_atomic;

pub const EVENT_DETECTED: &str = "busy_wait_detected";
pub const EVENT_SELF_HEAL_SKIPPED: &str = "self_heal_skipped";
pub const EVENT_SELF_HEAL: &str = "self_heal";

/// One audit line. Append-only; never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyWaitEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub ready: usize,
    pub in_progress: usize,
    pub idle_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BusyWaitEvent {
    pub fn new(
        event_type: &str,
        timestamp: DateTime<Utc>,
        counts: QueueCounts,
        idle_count: u64,
    ) -> Self {
        Self {
            timestamp,
            event_type: event_type.to_string(),
            ready: counts.ready,
            in_progress: counts.in_progress,
            idle_count,
            recovered: None,
            result: None,
            error: None,
            detail: None,
        }
    }
}

/// Load busy-wait state; a missing file is the default state.
pub fn load_busy_wait(path: &Path) -> Result<BusyWaitState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BusyWaitState::default()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write busy-wait state (temp file + rename).
pub fn save_busy_wait(path: &Path, state: &BusyWaitState) -> Result<()> {
    debug!(path = %path.display(), attempts = state.self_heal_attempts, "writing busy-wait state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub fn append_event(path: &Path, event: &BusyWaitEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(event).context("serialize busy-wait event")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).single().expect("time")
    }

    #[test]
    fn missing_state_is_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_busy_wait(&temp.path().join("busy_wait.json")).expect("load");
        assert_eq!(state, BusyWaitState::default());
    }

    #[test]
    fn state_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("busy_wait.json");
        let state = BusyWaitState {
            last_self_heal_at: Some(now()),
            self_heal_attempts: 2,
            last_self_heal_result: Some("recovered=1 ready_after=3".to_string()),
            last_idle_count: 20,
            ..BusyWaitState::default()
        };
        save_busy_wait(&path, &state).expect("save");
        assert_eq!(load_busy_wait(&path).expect("load"), state);
    }

    #[test]
    fn events_append_one_line_each() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("busy_wait_events.jsonl");
        let counts = QueueCounts {
            ready: 2,
            in_progress: 1,
        };
        let first = BusyWaitEvent::new(EVENT_DETECTED, now(), counts, 10);
        let mut second = BusyWaitEvent::new(EVENT_SELF_HEAL_SKIPPED, now(), counts, 10);
        second.detail = Some("self_heal_cooldown_active".to_string());
        append_event(&path, &first).expect("append");
        append_event(&path, &second).expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"busy_wait_detected\""));
        let parsed: BusyWaitEvent = serde_json::from_str(lines[1]).expect("parse");
        assert_eq!(parsed, second);
    }
}
