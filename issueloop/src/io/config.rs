//! Loop profile stored at `.issueloop/profile.toml`.
//!
//! The profile is re-read on every iteration. Missing fields default to
//! values suitable for an unattended deployment; a missing file is the
//! all-defaults profile.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::busy_wait::SelfHealPolicy;
use crate::core::gate::{DEFAULT_REQUEUE_MAX, GateConfig};
use crate::io::store::write_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Profile {
    pub codex: CodexConfig,
    #[serde(rename = "loop")]
    pub looping: LoopConfig,
    pub circuit: CircuitConfig,
    pub busy_wait: BusyWaitConfig,
    pub watchdog: WatchdogConfig,
    pub gate: GateSettings,
    pub validation: ValidationConfig,
    pub handoff: HandoffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodexConfig {
    pub binary: String,
    /// Model used when the role has no entry in `models`.
    pub model: String,
    pub sandbox: String,
    pub approval: String,
    pub extra_args: Vec<String>,
    pub timeout_secs: u64,
    pub attempts: u32,
    /// `0` retries immediately.
    pub backoff_base_secs: u64,
    pub tail_bytes: usize,
    /// Role -> model.
    pub models: BTreeMap<String, String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            model: "gpt-5-codex".to_string(),
            sandbox: "workspace-write".to_string(),
            approval: "never".to_string(),
            extra_args: Vec::new(),
            timeout_secs: 30 * 60,
            attempts: 3,
            backoff_base_secs: 10,
            tail_bytes: crate::io::process::DEFAULT_TAIL_BYTES,
            models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub idle_interval_secs: u64,
    /// Stop after this many processed issues (`0` = unlimited).
    pub max_loops: u64,
    /// Stop after this many consecutive idle iterations (`0` = unlimited).
    pub no_ready_max_loops: u64,
    pub exit_on_idle: bool,
    pub recover_on_start: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 30,
            max_loops: 0,
            no_ready_max_loops: 0,
            exit_on_idle: false,
            recover_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitConfig {
    pub threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: crate::core::circuit::DEFAULT_THRESHOLD,
            cooldown_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusyWaitConfig {
    /// Detect every Nth consecutive idle iteration (`0` disables detection).
    pub idle_threshold: u64,
    pub self_heal_enabled: bool,
    pub self_heal_max_attempts: u32,
    pub self_heal_cooldown_secs: u64,
    pub self_heal_command: Option<String>,
    pub self_heal_timeout_secs: u64,
    pub doctor_auto_repair: bool,
    /// Prints a JSON array of `{"status": "pass|warn|fail"}` entries.
    pub doctor_command: Option<String>,
}

impl Default for BusyWaitConfig {
    fn default() -> Self {
        Self {
            idle_threshold: 10,
            self_heal_enabled: true,
            self_heal_max_attempts: 3,
            self_heal_cooldown_secs: 15 * 60,
            self_heal_command: None,
            self_heal_timeout_secs: 5 * 60,
            doctor_auto_repair: false,
            doctor_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Scan every Nth tick (`0` and `1` both mean every tick).
    pub every_ticks: u64,
    pub stale_after_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_ticks: 1,
            stale_after_secs: 2 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateSettings {
    pub exit_signal_enabled: bool,
    pub exit_signal: String,
    pub require_handoff: bool,
    pub role_validation: bool,
    pub requeue_max: u32,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            exit_signal_enabled: false,
            exit_signal: "ISSUE_COMPLETE".to_string(),
            require_handoff: false,
            role_validation: false,
            requeue_max: DEFAULT_REQUEUE_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Fallback command for roles without an entry in `roles`.
    pub command: Option<String>,
    pub timeout_secs: u64,
    /// Role -> command.
    pub roles: BTreeMap<String, String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 30 * 60,
            roles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandoffConfig {
    /// Role -> top-level fields the handoff JSON must carry.
    pub required_fields: BTreeMap<String, Vec<String>>,
    /// Role -> JSON Schema file (relative to the project root) the artifact must satisfy.
    pub schemas: BTreeMap<String, PathBuf>,
}

/// Upper bound for any cooldown: 30 days.
pub const MAX_COOLDOWN_SECS: u64 = 30 * 24 * 60 * 60;

/// Cooldown as a signed delta, saturating at [`MAX_COOLDOWN_SECS`].
pub fn cooldown_delta(secs: u64) -> chrono::Duration {
    i64::try_from(secs.min(MAX_COOLDOWN_SECS))
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or_else(chrono::Duration::zero)
}

/// Per-role profile entry. Keys match case-insensitively, like issue roles.
pub fn role_entry<'a, V>(map: &'a BTreeMap<String, V>, role: Option<&str>) -> Option<&'a V> {
    let role = role?;
    map.get(role).or_else(|| {
        map.iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(role))
            .map(|(_, value)| value)
    })
}

impl Profile {
    pub fn validate(&self) -> Result<()> {
        if self.codex.binary.trim().is_empty() {
            return Err(anyhow!("codex.binary must be non-empty"));
        }
        if self.codex.timeout_secs == 0 {
            return Err(anyhow!("codex.timeout_secs must be > 0"));
        }
        if self.codex.attempts == 0 {
            return Err(anyhow!("codex.attempts must be > 0"));
        }
        if self.circuit.threshold == 0 {
            return Err(anyhow!("circuit.threshold must be > 0"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        if self.circuit.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(anyhow!("circuit.cooldown_secs must be <= {MAX_COOLDOWN_SECS}"));
        }
        if self.busy_wait.self_heal_cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(anyhow!("busy_wait.self_heal_cooldown_secs must be <= {MAX_COOLDOWN_SECS}"));
        }
        if self.gate.exit_signal_enabled && self.gate.exit_signal.trim().is_empty() {
            return Err(anyhow!("gate.exit_signal must be non-empty when enabled"));
        }
        Ok(())
    }

    pub fn model_for(&self, role: Option<&str>) -> &str {
        role_entry(&self.codex.models, role)
            .map(String::as_str)
            .unwrap_or(self.codex.model.as_str())
    }

    /// Role-scoped command if present, then the fallback command.
    pub fn validation_command_for(&self, role: Option<&str>) -> Option<&str> {
        role_entry(&self.validation.roles, role)
            .or(self.validation.command.as_ref())
            .map(String::as_str)
            .filter(|c| !c.trim().is_empty())
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            exit_signal: self
                .gate
                .exit_signal_enabled
                .then(|| self.gate.exit_signal.clone()),
            require_handoff: self.gate.require_handoff,
            role_validation: self.gate.role_validation,
        }
    }

    pub fn self_heal_policy(&self) -> SelfHealPolicy {
        SelfHealPolicy {
            enabled: self.busy_wait.self_heal_enabled,
            max_attempts: self.busy_wait.self_heal_max_attempts,
            cooldown: cooldown_delta(self.busy_wait.self_heal_cooldown_secs),
        }
    }

    pub fn circuit_cooldown(&self) -> chrono::Duration {
        cooldown_delta(self.circuit.cooldown_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.looping.idle_interval_secs)
    }

    /// Names of top-level sections that differ from `other`.
    pub fn changed_sections(&self, other: &Profile) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.codex != other.codex {
            changed.push("codex");
        }
        if self.looping != other.looping {
            changed.push("loop");
        }
        if self.circuit != other.circuit {
            changed.push("circuit");
        }
        if self.busy_wait != other.busy_wait {
            changed.push("busy_wait");
        }
        if self.watchdog != other.watchdog {
            changed.push("watchdog");
        }
        if self.gate != other.gate {
            changed.push("gate");
        }
        if self.validation != other.validation {
            changed.push("validation");
        }
        if self.handoff != other.handoff {
            changed.push("handoff");
        }
        changed
    }

    /// One-line summary for reload logs.
    pub fn summary(&self) -> String {
        format!(
            "model={} attempts={} timeout={}s backoff={}s circuit={}/{}s idle={}s exit_signal={} watchdog={}",
            self.codex.model,
            self.codex.attempts,
            self.codex.timeout_secs,
            self.codex.backoff_base_secs,
            self.circuit.threshold,
            self.circuit.cooldown_secs,
            self.looping.idle_interval_secs,
            self.gate.exit_signal_enabled,
            self.watchdog.enabled,
        )
    }
}

/// Where the loop reads its profile from on every iteration.
pub trait ProfileSource {
    fn load(&self) -> Result<Profile>;
}

/// Profile backed by a TOML file.
#[derive(Debug, Clone)]
pub struct FileProfileSource {
    pub path: PathBuf,
}

impl ProfileSource for FileProfileSource {
    fn load(&self) -> Result<Profile> {
        load_profile(&self.path)
    }
}

/// Fixed in-memory profile.
#[derive(Debug, Clone)]
pub struct StaticProfileSource(pub Profile);

impl ProfileSource for StaticProfileSource {
    fn load(&self) -> Result<Profile> {
        Ok(self.0.clone())
    }
}

/// Load a profile from a TOML file; missing file yields the defaults.
pub fn load_profile(path: &Path) -> Result<Profile> {
    if !path.exists() {
        let profile = Profile::default();
        profile.validate()?;
        return Ok(profile);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let profile: Profile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    profile.validate()?;
    Ok(profile)
}

pub fn write_profile(path: &Path, profile: &Profile) -> Result<()> {
    profile.validate()?;
    let mut buf = toml::to_string_pretty(profile).context("serialize profile toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Metadata written whenever a changed profile is picked up mid-run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadMeta {
    pub reloaded_at: Option<DateTime<Utc>>,
    pub reload_count: u64,
    pub changed: Vec<String>,
    pub summary: String,
}

pub fn load_reload_meta(path: &Path) -> Result<ReloadMeta> {
    if !path.exists() {
        return Ok(ReloadMeta::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn write_reload_meta(path: &Path, meta: &ReloadMeta) -> Result<()> {
    debug!(path = %path.display(), reload_count = meta.reload_count, "writing reload metadata");
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    write_atomic(path, &buf)
}
