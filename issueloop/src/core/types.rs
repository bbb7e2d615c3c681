//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between core components. They carry
//! no I/O and their serialized forms are observable in issue files and logs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Queue directory an issue lives in. The header inside the file mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    Ready,
    InProgress,
    Done,
    Blocked,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 4] = [
        IssueStatus::Ready,
        IssueStatus::InProgress,
        IssueStatus::Done,
        IssueStatus::Blocked,
    ];

    /// Directory name and header value.
    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Ready => "ready",
            IssueStatus::InProgress => "in-progress",
            IssueStatus::Done => "done",
            IssueStatus::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ready" => Some(IssueStatus::Ready),
            "in-progress" | "in_progress" => Some(IssueStatus::InProgress),
            "done" => Some(IssueStatus::Done),
            "blocked" => Some(IssueStatus::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of processing one claimed issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Done,
    Blocked,
    Requeued,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Blocked => "blocked",
            Outcome::Requeued => "requeued",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory result of one processed issue; feeds the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueProcessResult {
    pub outcome: Outcome,
    pub failure_reason: Option<String>,
    /// The failure came from the agent invocation itself.
    pub codex_failure: bool,
    /// Reason of the last agent attempt when `failure_reason` is a composite.
    pub codex_failure_cause: Option<String>,
    pub codex_retryable: bool,
    /// The agent run was interrupted by shutdown.
    pub canceled: bool,
}

impl IssueProcessResult {
    pub fn done() -> Self {
        Self {
            outcome: Outcome::Done,
            failure_reason: None,
            codex_failure: false,
            codex_failure_cause: None,
            codex_retryable: false,
            canceled: false,
        }
    }

    pub fn failed(outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            failure_reason: Some(reason.into()),
            ..Self::done()
        }
    }
}

/// Outcome of a validation command run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationOutcome {
    Pass,
    Fail,
    TimedOut,
    /// No command applies to this role.
    Skipped,
}
