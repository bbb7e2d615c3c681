//! Canonical paths under `.issueloop/` for a project root.

use std::path::{Path, PathBuf};

use crate::core::types::IssueStatus;

#[derive(Debug, Clone)]
pub struct QueuePaths {
    pub project_dir: PathBuf,
    pub root: PathBuf,
    pub issues_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub validation_logs_dir: PathBuf,
    pub handoff_dir: PathBuf,
    pub profile_path: PathBuf,
    pub enabled_path: PathBuf,
    pub circuit_path: PathBuf,
    pub busy_wait_state_path: PathBuf,
    pub busy_wait_events_path: PathBuf,
    pub reload_meta_path: PathBuf,
    pub journal_path: PathBuf,
    pub self_heal_log_path: PathBuf,
}

impl QueuePaths {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let root = project_dir.join(".issueloop");
        let state_dir = root.join("state");
        let logs_dir = root.join("logs");
        Self {
            project_dir,
            root: root.clone(),
            issues_dir: root.join("issues"),
            state_dir: state_dir.clone(),
            logs_dir: logs_dir.clone(),
            runs_dir: logs_dir.join("runs"),
            validation_logs_dir: logs_dir.join("validation"),
            handoff_dir: root.join("handoff"),
            profile_path: root.join("profile.toml"),
            enabled_path: root.join("enabled"),
            circuit_path: state_dir.join("circuit_breaker.state"),
            busy_wait_state_path: state_dir.join("busy_wait.json"),
            busy_wait_events_path: logs_dir.join("busy_wait_events.jsonl"),
            reload_meta_path: state_dir.join("profile_reload.json"),
            journal_path: logs_dir.join("progress.log"),
            self_heal_log_path: logs_dir.join("self_heal.log"),
        }
    }

    pub fn status_dir(&self, status: IssueStatus) -> PathBuf {
        self.issues_dir.join(status.as_str())
    }

    /// Directories the loop must be able to write to.
    pub fn writable_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = IssueStatus::ALL
            .iter()
            .map(|s| self.status_dir(*s))
            .collect();
        dirs.extend([
            self.state_dir.clone(),
            self.logs_dir.clone(),
            self.runs_dir.clone(),
            self.validation_logs_dir.clone(),
        ]);
        dirs
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}
