//! Completion gate: decides whether a processed issue is really finished.
//!
//! The gate is evaluated in a fixed order and is pure over the evidence the
//! caller collected (agent last message, handoff artifact, validation run,
//! issue body).

use crate::issue::checklist_counts;

pub const EXIT_SIGNAL_PREFIX: &str = "completion_gate_exit_signal_";
pub const EXIT_SIGNAL_MISSING_OUTPUT: &str = "completion_gate_exit_signal_missing_output";
pub const EXIT_SIGNAL_ISSUE_ID_MISSING: &str = "completion_gate_exit_signal_issue_id_missing";
pub const EXIT_SIGNAL_MISSING: &str = "completion_gate_exit_signal_missing";
pub const CHECKLIST_MISSING_HANDOFF: &str = "completion_gate_checklist_missing_handoff";
pub const CHECKLIST_INCOMPLETE: &str = "completion_gate_checklist_incomplete";

/// Default number of automatic requeues for exit-signal failures.
pub const DEFAULT_REQUEUE_MAX: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Literal completion marker; `None` disables exit-signal mode.
    pub exit_signal: Option<String>,
    pub require_handoff: bool,
    pub role_validation: bool,
}

/// Evidence gathered after the agent and validation ran.
#[derive(Debug, Clone)]
pub struct GateEvidence<'a> {
    pub issue_id: &'a str,
    /// Agent last-message output; `None` when the file was never written.
    pub last_message: Option<&'a str>,
    pub handoff_present: bool,
    /// A role-scoped validation command ran (and passed) for this issue.
    pub validation_ran: bool,
    /// Issue body without result history.
    pub issue_body: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Fail(&'static str),
}

pub fn evaluate(config: &GateConfig, evidence: &GateEvidence<'_>) -> GateVerdict {
    if let Some(signal) = &config.exit_signal {
        return evaluate_exit_signal(signal, evidence);
    }

    if config.require_handoff && !evidence.handoff_present {
        return GateVerdict::Fail(CHECKLIST_MISSING_HANDOFF);
    }
    let satisfied = (config.require_handoff && evidence.handoff_present)
        || (config.role_validation && evidence.validation_ran);
    if satisfied {
        return GateVerdict::Pass;
    }

    let (total, checked) = checklist_counts(evidence.issue_body);
    if total > 0 && checked == 0 {
        return GateVerdict::Fail(CHECKLIST_INCOMPLETE);
    }
    GateVerdict::Pass
}

fn evaluate_exit_signal(signal: &str, evidence: &GateEvidence<'_>) -> GateVerdict {
    let Some(output) = evidence.last_message else {
        return GateVerdict::Fail(EXIT_SIGNAL_MISSING_OUTPUT);
    };
    let expected = format!("{} {}", signal, evidence.issue_id);
    if output.contains(&expected) {
        return GateVerdict::Pass;
    }
    if output.contains(signal) {
        return GateVerdict::Fail(EXIT_SIGNAL_ISSUE_ID_MISSING);
    }
    GateVerdict::Fail(EXIT_SIGNAL_MISSING)
}

/// Decision for a failed gate: requeue (bounded) or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDecision {
    Requeue { attempt: u32, max: u32 },
    Block,
}

/// Decide whether `reason` may be auto-requeued given the issue's result history.
///
/// Only exit-signal reasons participate. The retry count is implicit: the
/// number of prior result blocks whose text carries the exit-signal prefix.
pub fn requeue_decision(reason: &str, history: &str, max: u32) -> RequeueDecision {
    if !reason.starts_with(EXIT_SIGNAL_PREFIX) {
        return RequeueDecision::Block;
    }
    let prior = history.to_lowercase().matches(EXIT_SIGNAL_PREFIX).count() as u32;
    let attempt = prior + 1;
    if attempt <= max {
        RequeueDecision::Requeue { attempt, max }
    } else {
        RequeueDecision::Block
    }
}
