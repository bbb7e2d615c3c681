//! Busy-wait handling: detection bookkeeping and the bounded self-heal action.
//!
//! Every sub-step of a heal is best-effort. Failures are folded into one
//! combined error string and never abort the loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::busy_wait::{BusyWaitState, Eligibility, QueueCounts, eligibility, should_detect};
use crate::core::types::IssueStatus;
use crate::io::busy_wait_store::{
    BusyWaitEvent, EVENT_DETECTED, EVENT_SELF_HEAL, EVENT_SELF_HEAL_SKIPPED, append_event,
    save_busy_wait,
};
use crate::io::config::Profile;
use crate::io::process::{DEFAULT_TAIL_BYTES, RunOptions, run_command, shell};
use crate::io::store::IssueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// One diagnostic reported by the repair collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorCheck {
    #[serde(default)]
    pub name: Option<String>,
    pub status: CheckStatus,
}

/// External "run repair, report checks" collaborator.
pub trait Doctor {
    fn repair(&self, cancel: &CancelToken) -> Result<Vec<DoctorCheck>>;
}

/// Doctor backed by a shell command printing a JSON array of checks.
#[derive(Debug, Clone)]
pub struct CommandDoctor {
    pub command: String,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
}

impl Doctor for CommandDoctor {
    #[instrument(skip_all, fields(command = %self.command))]
    fn repair(&self, cancel: &CancelToken) -> Result<Vec<DoctorCheck>> {
        let output = run_command(
            shell(&self.command, &self.workdir),
            &RunOptions {
                stdin: None,
                timeout: self.timeout,
                tail_bytes: DEFAULT_TAIL_BYTES,
                log_path: Some(&self.log_path),
            },
            cancel,
        )?;
        if output.timed_out {
            return Err(anyhow!("doctor timed out after {}s", self.timeout.as_secs()));
        }
        if !output.success() {
            return Err(anyhow!("doctor exited with {:?}", output.exit_code()));
        }
        parse_checks(&output.tail)
    }
}

/// Parse the whole output as a JSON array, else the last line that is one.
pub fn parse_checks(output: &str) -> Result<Vec<DoctorCheck>> {
    if let Ok(checks) = serde_json::from_str(output.trim()) {
        return Ok(checks);
    }
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('['))
        .find_map(|line| serde_json::from_str(line).ok())
        .context("doctor output is not a JSON array of checks")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoctorSummary {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
}

impl DoctorSummary {
    pub fn from_checks(checks: &[DoctorCheck]) -> Self {
        let mut summary = Self::default();
        for check in checks {
            match check.status {
                CheckStatus::Pass => summary.pass += 1,
                CheckStatus::Warn => summary.warn += 1,
                CheckStatus::Fail => summary.fail += 1,
            }
        }
        summary
    }
}

/// Outcome of one heal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfHealReport {
    pub recovered: usize,
    pub command_exit: Option<i32>,
    pub doctor: Option<DoctorSummary>,
    pub ready_after: usize,
    pub summary: String,
    /// Sub-step errors joined with `; `.
    pub error: Option<String>,
}

pub struct SelfHealDeps<'a> {
    pub store: &'a IssueStore,
    pub doctor: Option<&'a dyn Doctor>,
    pub cancel: &'a CancelToken,
}

/// Recover in-progress work, run the heal command and doctor, recount `ready/`.
#[instrument(skip_all)]
pub fn run_self_heal(deps: &SelfHealDeps<'_>, profile: &Profile, now: DateTime<Utc>) -> SelfHealReport {
    let config = &profile.busy_wait;
    let mut errors: Vec<String> = Vec::new();
    let mut parts: Vec<String> = Vec::new();

    let recovered = match deps.store.recover_all(now) {
        Ok(recovered) => recovered.len(),
        Err(err) => {
            errors.push(format!("recover: {err:#}"));
            0
        }
    };
    parts.push(format!("recovered={recovered}"));

    let mut command_exit = None;
    if let Some(command) = config.self_heal_command.as_deref().filter(|c| !c.trim().is_empty()) {
        let paths = deps.store.paths();
        match run_command(
            shell(command, paths.project_dir()),
            &RunOptions {
                stdin: None,
                timeout: Duration::from_secs(config.self_heal_timeout_secs),
                tail_bytes: 4 * 1024,
                log_path: Some(&paths.self_heal_log_path),
            },
            deps.cancel,
        ) {
            Ok(output) if output.timed_out => {
                parts.push("command=timeout".to_string());
                errors.push(format!("command timed out after {}s", config.self_heal_timeout_secs));
            }
            Ok(output) => {
                command_exit = output.exit_code();
                let code = command_exit.map_or_else(|| "killed".to_string(), |c| c.to_string());
                parts.push(format!("command_exit={code}"));
                if !output.success() {
                    errors.push(format!("command exited with {code}"));
                }
            }
            Err(err) => errors.push(format!("command: {err:#}")),
        }
    }

    let mut doctor = None;
    if config.doctor_auto_repair {
        match deps.doctor {
            Some(d) => match d.repair(deps.cancel) {
                Ok(checks) => {
                    let summary = DoctorSummary::from_checks(&checks);
                    parts.push(format!(
                        "doctor=pass:{},warn:{},fail:{}",
                        summary.pass, summary.warn, summary.fail
                    ));
                    doctor = Some(summary);
                }
                Err(err) => errors.push(format!("doctor: {err:#}")),
            },
            None => errors.push("doctor: no doctor command configured".to_string()),
        }
    }

    let ready_after = match deps.store.count(IssueStatus::Ready) {
        Ok(n) => n,
        Err(err) => {
            errors.push(format!("count ready: {err:#}"));
            0
        }
    };
    parts.push(format!("ready_after={ready_after}"));

    let report = SelfHealReport {
        recovered,
        command_exit,
        doctor,
        ready_after,
        summary: parts.join(" "),
        error: (!errors.is_empty()).then(|| errors.join("; ")),
    };
    match &report.error {
        Some(error) => warn!(summary = %report.summary, error = %error, "self-heal finished with errors"),
        None => info!(summary = %report.summary, "self-heal finished"),
    }
    report
}

/// What the loop should do after an idle iteration was inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Sleep the idle interval as usual.
    Sleep,
    /// A heal added ready work; pick again immediately.
    RetryNow,
}

/// Inspect an idle iteration for a busy-wait and heal if allowed.
///
/// State is mutated and persisted only when a busy-wait is detected.
pub fn on_idle(
    deps: &SelfHealDeps<'_>,
    profile: &Profile,
    state: &mut BusyWaitState,
    is_owner: bool,
    idle_count: u64,
    counts: QueueCounts,
    now: DateTime<Utc>,
) -> IdleAction {
    if !should_detect(is_owner, idle_count, profile.busy_wait.idle_threshold, counts) {
        return IdleAction::Sleep;
    }
    let paths = deps.store.paths();
    warn!(
        idle_count,
        ready = counts.ready,
        in_progress = counts.in_progress,
        "busy-wait detected: queue has work but no progress"
    );
    state.last_detected_at = Some(now);
    state.last_idle_count = idle_count;
    record_event(
        &paths.busy_wait_events_path,
        &BusyWaitEvent::new(EVENT_DETECTED, now, counts, idle_count),
    );

    let action = match eligibility(&profile.self_heal_policy(), state, now) {
        Eligibility::Denied {
            reason,
            remaining_secs,
        } => {
            info!(reason, remaining_secs = ?remaining_secs, "self-heal skipped");
            let mut event = BusyWaitEvent::new(EVENT_SELF_HEAL_SKIPPED, now, counts, idle_count);
            event.detail = Some(match remaining_secs {
                Some(secs) => format!("{reason} remaining_secs={secs}"),
                None => reason.to_string(),
            });
            record_event(&paths.busy_wait_events_path, &event);
            IdleAction::Sleep
        }
        Eligibility::Allowed => {
            state.self_heal_attempts = state.self_heal_attempts.saturating_add(1);
            state.last_self_heal_at = Some(now);
            info!(attempt = state.self_heal_attempts, "running self-heal");
            let report = run_self_heal(deps, profile, now);
            state.last_self_heal_result = Some(report.summary.clone());
            state.last_self_heal_error = report.error.clone();
            state.last_recovered_count = report.recovered;
            state.last_ready_after = report.ready_after;

            let mut event = BusyWaitEvent::new(EVENT_SELF_HEAL, now, counts, idle_count);
            event.recovered = Some(report.recovered);
            event.result = Some(report.summary.clone());
            event.error = report.error.clone();
            record_event(&paths.busy_wait_events_path, &event);

            if report.ready_after > counts.ready {
                IdleAction::RetryNow
            } else {
                IdleAction::Sleep
            }
        }
    };

    if let Err(err) = save_busy_wait(&paths.busy_wait_state_path, state) {
        warn!(err = %format!("{err:#}"), "failed to persist busy-wait state");
    }
    action
}

fn record_event(path: &std::path::Path, event: &BusyWaitEvent) {
    if let Err(err) = append_event(path, event) {
        warn!(err = %format!("{err:#}"), event = %event.event_type, "failed to append busy-wait event");
    }
}
