//! Time-based recovery of abandoned in-progress issues.
//!
//! Runs on a tick schedule regardless of idle state, so a worker that died
//! mid-task is noticed even while other issues keep flowing.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::io::config::WatchdogConfig;
use crate::io::store::{IssueStore, Recovered};

/// Whether tick `tick` (1-based) is a scan tick. `0` and `1` mean every tick.
pub fn is_due(every_ticks: u64, tick: u64) -> bool {
    tick % every_ticks.max(1) == 0
}

/// Scan `in-progress/` on scheduled ticks and recover stale files.
pub fn run_watchdog(
    store: &IssueStore,
    config: &WatchdogConfig,
    tick: u64,
    now: DateTime<Utc>,
) -> Result<Vec<Recovered>> {
    if !config.enabled || !is_due(config.every_ticks, tick) {
        return Ok(Vec::new());
    }
    let stale_after = Duration::from_secs(config.stale_after_secs);
    debug!(tick, stale_after_secs = config.stale_after_secs, "watchdog scan");
    let recovered = store.recover_stale(stale_after, now)?;
    for r in &recovered {
        warn!(from = %r.from, to = %r.to, "watchdog recovered stale in-progress issue");
    }
    Ok(recovered)
}
