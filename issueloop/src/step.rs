//! Orchestration for processing one claimed issue.
//!
//! Claim, run the agent with retries, run validation, evaluate the
//! completion gate, then move the issue to its terminal (or requeued)
//! location with an appended result block and a journal line.

use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::{REASON_CANCELED, REASON_INTERRUPTED};
use crate::core::gate::{GateEvidence, GateVerdict, RequeueDecision, evaluate, requeue_decision};
use crate::core::types::{IssueProcessResult, IssueStatus, Outcome, ValidationOutcome};
use crate::io::config::{Profile, role_entry};
use crate::io::executor::{CodexError, ExecRequest, Executor, RetryPolicy, run_with_retries};
use crate::io::handoff::{HandoffRequirements, check_handoff, handoff_path};
use crate::io::journal::{JournalEntry, RunPaths, append_journal};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::store::{ClaimOutcome, IssueStore, MoveOutcome, unique_name};
use crate::io::validation::{ValidationRequest, ValidationRunner, run_validation_if_configured};
use crate::issue::{Issue, ResultBlock, append_result};

pub const REASON_VALIDATION_FAILED: &str = "validation_failed";
pub const REASON_VALIDATION_TIMEOUT: &str = "validation_timeout";
pub const REASON_PROMPT_FAILED: &str = "prompt_build_failed";

/// Collaborators needed to process an issue.
pub struct StepDeps<'a> {
    pub store: &'a IssueStore,
    pub executor: &'a dyn Executor,
    pub validation: &'a dyn ValidationRunner,
    pub cancel: &'a CancelToken,
}

/// Result of one `process_issue` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Another worker claimed the issue first.
    Skipped,
    Processed {
        issue_id: String,
        result: IssueProcessResult,
    },
}

/// Claim `name` from `ready/` and drive it to done, blocked, or requeued.
///
/// Errors are bookkeeping failures (moves, directory writes); agent and gate
/// failures are reported through [`IssueProcessResult`].
#[instrument(skip_all, fields(issue = %name))]
pub fn process_issue(deps: &StepDeps<'_>, profile: &Profile, name: &str) -> Result<StepOutcome> {
    let issue = match deps.store.claim(name)? {
        ClaimOutcome::Claimed(issue) => issue,
        ClaimOutcome::AlreadyClaimed => {
            info!("issue claimed by another worker, skipping");
            return Ok(StepOutcome::Skipped);
        }
    };
    let started_at = Utc::now();
    let run = RunPaths::new(deps.store.paths(), &issue.id, started_at);
    let role = issue.role.as_deref();
    info!(issue = %issue.id, role = role.unwrap_or("-"), priority = issue.priority, "processing issue");

    let result = evaluate_issue(deps, profile, &issue, &run);
    finalize(deps.store, &issue, &run, result)
}

fn evaluate_issue(
    deps: &StepDeps<'_>,
    profile: &Profile,
    issue: &Issue,
    run: &RunPaths,
) -> IssueProcessResult {
    let role = issue.role.as_deref();
    let paths = deps.store.paths();
    let handoff = handoff_path(&paths.handoff_dir, &issue.id, role);
    let handoff_display = handoff.display().to_string();
    let required_fields = role_entry(&profile.handoff.required_fields, role)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let schema_path =
        role_entry(&profile.handoff.schemas, role).map(|p| paths.project_dir().join(p));
    let gate = profile.gate_config();

    let project_dir = paths.project_dir().display().to_string();
    let prompt = match PromptBuilder::default().build(
        issue,
        &PromptInputs {
            project_dir: &project_dir,
            exit_signal: gate.exit_signal.as_deref(),
            handoff_path: gate.require_handoff.then_some(handoff_display.as_str()),
            handoff_fields: required_fields,
        },
    ) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "failed to build prompt");
            return IssueProcessResult::failed(Outcome::Blocked, REASON_PROMPT_FAILED);
        }
    };

    let request = ExecRequest {
        workdir: paths.project_dir().to_path_buf(),
        prompt,
        model: profile.model_for(role).to_string(),
        last_message_path: Some(run.last_message_path.clone()),
        log_path: run.log_path.clone(),
        timeout: std::time::Duration::from_secs(profile.codex.timeout_secs),
        tail_bytes: profile.codex.tail_bytes,
    };
    let policy = RetryPolicy {
        attempts: profile.codex.attempts,
        backoff_base_secs: profile.codex.backoff_base_secs,
    };
    if let Err(err) = run_with_retries(deps.executor, &request, policy, deps.cancel) {
        return codex_failure(err, deps.cancel);
    }

    let role_command = role_entry(&profile.validation.roles, role).is_some();
    let validation_request = profile
        .validation_command_for(role)
        .map(|command| ValidationRequest {
            command: command.to_string(),
            workdir: paths.project_dir().to_path_buf(),
            log_path: run.validation_log_path.clone(),
            timeout: std::time::Duration::from_secs(profile.validation.timeout_secs),
        });
    let validation = match run_validation_if_configured(
        deps.validation,
        validation_request.as_ref(),
        deps.cancel,
    ) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "validation command could not run");
            ValidationOutcome::Fail
        }
    };
    if deps.cancel.is_canceled() {
        return canceled();
    }
    match validation {
        ValidationOutcome::Fail => {
            return IssueProcessResult::failed(Outcome::Blocked, REASON_VALIDATION_FAILED);
        }
        ValidationOutcome::TimedOut => {
            return IssueProcessResult::failed(Outcome::Blocked, REASON_VALIDATION_TIMEOUT);
        }
        ValidationOutcome::Pass | ValidationOutcome::Skipped => {}
    }

    let handoff_present = gate.require_handoff && {
        let requirements = HandoffRequirements {
            required_fields,
            schema_path: schema_path.as_deref(),
        };
        match check_handoff(&handoff, &requirements) {
            Ok(status) => status.is_present(),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "handoff check failed");
                false
            }
        }
    };
    let last_message = read_last_message(run);
    let body = issue.body();
    let evidence = GateEvidence {
        issue_id: &issue.id,
        last_message: last_message.as_deref(),
        handoff_present,
        validation_ran: role_command && validation == ValidationOutcome::Pass,
        issue_body: body,
    };

    match evaluate(&gate, &evidence) {
        GateVerdict::Pass => IssueProcessResult::done(),
        GateVerdict::Fail(reason) => {
            match requeue_decision(reason, issue.history(), profile.gate.requeue_max) {
                RequeueDecision::Requeue { attempt, max } => {
                    info!(reason, attempt, max, "completion gate failed, requeueing");
                    IssueProcessResult::failed(Outcome::Requeued, reason)
                }
                RequeueDecision::Block => {
                    warn!(reason, "completion gate failed, blocking");
                    IssueProcessResult::failed(Outcome::Blocked, reason)
                }
            }
        }
    }
}

fn codex_failure(err: CodexError, cancel: &CancelToken) -> IssueProcessResult {
    if err.is_canceled() {
        if cancel.is_canceled() {
            return canceled();
        }
        // An interrupt nobody asked for is the agent's failure, not a shutdown.
        warn!(exit_code = ?err.exit_code, "agent interrupted without cancellation");
        return IssueProcessResult {
            codex_failure: true,
            codex_failure_cause: Some(err.reason),
            codex_retryable: false,
            ..IssueProcessResult::failed(Outcome::Blocked, REASON_INTERRUPTED)
        };
    }
    warn!(reason = %err.reason, retryable = err.retryable, cause = ?err.cause, "agent failed");
    IssueProcessResult {
        codex_failure: true,
        codex_failure_cause: err.cause,
        codex_retryable: err.retryable,
        ..IssueProcessResult::failed(Outcome::Blocked, err.reason)
    }
}

/// Shutdown mid-issue: hand the issue back to `ready/`.
fn canceled() -> IssueProcessResult {
    IssueProcessResult {
        codex_failure: true,
        canceled: true,
        ..IssueProcessResult::failed(Outcome::Requeued, REASON_CANCELED)
    }
}

fn read_last_message(run: &RunPaths) -> Option<String> {
    match fs::read_to_string(&run.last_message_path) {
        Ok(contents) => Some(contents),
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %run.last_message_path.display(), err = %err, "cannot read last message");
            }
            None
        }
    }
}

fn finalize(
    store: &IssueStore,
    issue: &Issue,
    run: &RunPaths,
    result: IssueProcessResult,
) -> Result<StepOutcome> {
    let now = Utc::now();
    let timestamp = now.to_rfc3339();
    let log_file = run.log_path.display().to_string();
    let block = ResultBlock {
        timestamp: &timestamp,
        status: result.outcome.as_str(),
        reason: result.failure_reason.as_deref(),
        log_file: Some(&log_file),
    };
    let edit = |contents: &str| append_result(contents, &block);

    let moved = match result.outcome {
        Outcome::Requeued => store.requeue(&issue.name, now, edit)?,
        Outcome::Done => move_terminal(store, &issue.name, IssueStatus::Done, now, edit)?,
        Outcome::Blocked => move_terminal(store, &issue.name, IssueStatus::Blocked, now, edit)?,
    };
    let file_name = match &moved {
        MoveOutcome::Moved { name, .. } => name.as_str(),
        MoveOutcome::Vanished => {
            warn!(issue = %issue.id, "in-progress issue was moved by another worker before finalize");
            issue.name.as_str()
        }
    };

    if let Err(err) = append_journal(
        &store.paths().journal_path,
        &JournalEntry {
            timestamp: now,
            outcome: result.outcome,
            issue_id: &issue.id,
            file_name,
            role: issue.role.as_deref(),
            reason: result.failure_reason.as_deref(),
        },
    ) {
        warn!(err = %format!("{err:#}"), "failed to append journal");
    }

    info!(
        issue = %issue.id,
        outcome = %result.outcome,
        reason = result.failure_reason.as_deref().unwrap_or("none"),
        "issue finished"
    );
    Ok(StepOutcome::Processed {
        issue_id: issue.id.clone(),
        result,
    })
}

fn move_terminal<F>(
    store: &IssueStore,
    name: &str,
    to: IssueStatus,
    now: DateTime<Utc>,
    edit: F,
) -> Result<MoveOutcome>
where
    F: FnOnce(&str) -> String,
{
    let dest_dir = store.dir(to);
    let dest_name = if dest_dir.join(name).exists() {
        unique_name(&dest_dir, to.as_str(), now, name)
    } else {
        name.to_string()
    };
    store
        .move_issue(name, IssueStatus::InProgress, to, &dest_name, edit)
        .with_context(|| format!("move {name} to {to}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::REASON_AUTH;
    use crate::core::gate::{CHECKLIST_INCOMPLETE, EXIT_SIGNAL_MISSING};
    use crate::test_support::{ScriptedExecutor, ScriptedRun, ScriptedValidation, TestQueue};

    fn deps<'a>(
        queue: &'a TestQueue,
        executor: &'a ScriptedExecutor,
        validation: &'a ScriptedValidation,
        cancel: &'a CancelToken,
    ) -> StepDeps<'a> {
        StepDeps {
            store: queue.store(),
            executor,
            validation,
            cancel,
        }
    }

    fn processed(outcome: StepOutcome) -> IssueProcessResult {
        match outcome {
            StepOutcome::Processed { result, .. } => result,
            StepOutcome::Skipped => panic!("expected processed"),
        }
    }

    fn fast_profile() -> Profile {
        let mut profile = Profile::default();
        profile.codex.backoff_base_secs = 0;
        profile
    }

    #[test]
    fn success_moves_issue_to_done_with_result_block() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nrole: developer\nstatus: ready\n\nDo it.\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &fast_profile(), "001-a.md")
                .expect("process"),
        );
        assert_eq!(result, IssueProcessResult::done());

        let done = queue.read(IssueStatus::Done, "001-a.md");
        assert!(done.contains("status: done"));
        assert!(done.contains("## Result\n- timestamp: "));
        assert!(done.contains("- status: done\n- reason: none\n"));
        let journal = fs::read_to_string(&queue.store().paths().journal_path).expect("journal");
        assert!(journal.contains("done issue=ISS-1 file=001-a.md role=developer"));
        queue.assert_consistent();
    }

    #[test]
    fn terminal_agent_failure_blocks() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nstatus: ready\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::failure(REASON_AUTH, false)]);
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &fast_profile(), "001-a.md")
                .expect("process"),
        );
        assert_eq!(result.outcome, Outcome::Blocked);
        assert_eq!(result.failure_reason.as_deref(), Some(REASON_AUTH));
        assert!(result.codex_failure);
        assert!(!result.codex_retryable);
        assert_eq!(executor.calls(), 1);
        assert!(queue.read(IssueStatus::Blocked, "001-a.md").contains("- reason: codex_auth_error"));
        queue.assert_consistent();
    }

    #[test]
    fn retryable_failures_exhaust_into_composite_reason() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nstatus: ready\n");
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::failure("codex_exit_1", true),
            ScriptedRun::failure("codex_exit_1", true),
            ScriptedRun::failure("codex_exit_1", true),
        ]);
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &fast_profile(), "001-a.md")
                .expect("process"),
        );
        assert_eq!(result.failure_reason.as_deref(), Some("codex_failed_after_3_attempts"));
        assert_eq!(result.codex_failure_cause.as_deref(), Some("codex_exit_1"));
        assert!(result.codex_retryable);
    }

    #[test]
    fn missing_exit_signal_requeues_twice_then_blocks() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nstatus: ready\n\nWork.\n");
        let mut profile = fast_profile();
        profile.gate.exit_signal_enabled = true;
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        for expected in [Outcome::Requeued, Outcome::Requeued, Outcome::Blocked] {
            let name = queue.only_ready();
            let executor =
                ScriptedExecutor::new(vec![ScriptedRun::success().with_last_message("all done")]);
            let result = processed(
                process_issue(&deps(&queue, &executor, &validation, &cancel), &profile, &name)
                    .expect("process"),
            );
            assert_eq!(result.outcome, expected);
            assert_eq!(result.failure_reason.as_deref(), Some(EXIT_SIGNAL_MISSING));
            queue.assert_consistent();
        }
        let blocked = queue.store().list(IssueStatus::Blocked).expect("list");
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].history().matches("## Result").count(), 3);
    }

    #[test]
    fn exit_signal_with_issue_id_completes() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-9\nstatus: ready\n");
        let mut profile = fast_profile();
        profile.gate.exit_signal_enabled = true;
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::success().with_last_message("finished\nISSUE_COMPLETE ISS-9\n"),
        ]);
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &profile, "001-a.md")
                .expect("process"),
        );
        assert_eq!(result.outcome, Outcome::Done);
        assert!(executor.last_prompt().contains("ISSUE_COMPLETE ISS-9"));
    }

    #[test]
    fn unchecked_checklist_blocks() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nstatus: ready\n\n- [ ] one\n- [ ] two\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &fast_profile(), "001-a.md")
                .expect("process"),
        );
        assert_eq!(result.outcome, Outcome::Blocked);
        assert_eq!(result.failure_reason.as_deref(), Some(CHECKLIST_INCOMPLETE));
    }

    #[test]
    fn validation_failure_blocks() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nrole: qa\nstatus: ready\n");
        let mut profile = fast_profile();
        profile
            .validation
            .roles
            .insert("qa".to_string(), "just test".to_string());
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let validation = ScriptedValidation::new(vec![ValidationOutcome::TimedOut]);
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &profile, "001-a.md")
                .expect("process"),
        );
        assert_eq!(result.failure_reason.as_deref(), Some(REASON_VALIDATION_TIMEOUT));
        assert_eq!(validation.commands(), vec!["just test".to_string()]);
    }

    #[test]
    fn role_validation_satisfies_gate_despite_checklist() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nrole: qa\nstatus: ready\n\n- [ ] manual\n");
        let mut profile = fast_profile();
        profile.gate.role_validation = true;
        profile
            .validation
            .roles
            .insert("qa".to_string(), "just test".to_string());
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &profile, "001-a.md")
                .expect("process"),
        );
        assert_eq!(result.outcome, Outcome::Done);
    }

    #[test]
    fn required_handoff_must_exist() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nrole: planner\nstatus: ready\n");
        let mut profile = fast_profile();
        profile.gate.require_handoff = true;
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &profile, "001-a.md")
                .expect("process"),
        );
        assert_eq!(
            result.failure_reason.as_deref(),
            Some(crate::core::gate::CHECKLIST_MISSING_HANDOFF)
        );

        queue.add_ready("002-b.md", "id: ISS-2\nrole: planner\nstatus: ready\n");
        let handoff = queue.store().paths().handoff_dir.join("ISS-2.planner.json");
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::success().with_file(handoff, r#"{"summary": "planned"}"#),
        ]);
        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &profile, "002-b.md")
                .expect("process"),
        );
        assert_eq!(result.outcome, Outcome::Done);
    }

    #[test]
    fn cancellation_returns_issue_to_ready() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nstatus: ready\n");
        let cancel = CancelToken::new();
        let executor = ScriptedExecutor::new(vec![ScriptedRun::failure(REASON_CANCELED, false)])
            .cancel_on_exec(cancel.clone());
        let validation = ScriptedValidation::passing();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &fast_profile(), "001-a.md")
                .expect("process"),
        );
        assert!(result.canceled);
        assert_eq!(result.outcome, Outcome::Requeued);
        assert!(queue.read(IssueStatus::Ready, "001-a.md").contains("- reason: codex_canceled"));
        queue.assert_consistent();
    }

    #[test]
    fn unrequested_interrupt_blocks_as_agent_failure() {
        let queue = TestQueue::new();
        queue.add_ready("001-a.md", "id: ISS-1\nstatus: ready\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::failure(REASON_CANCELED, false)]);
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();

        let result = processed(
            process_issue(&deps(&queue, &executor, &validation, &cancel), &fast_profile(), "001-a.md")
                .expect("process"),
        );
        assert!(!result.canceled);
        assert_eq!(result.outcome, Outcome::Blocked);
        assert_eq!(result.failure_reason.as_deref(), Some(REASON_INTERRUPTED));
        assert!(result.codex_failure);
        assert!(!result.codex_retryable);
        assert_eq!(result.codex_failure_cause.as_deref(), Some(REASON_CANCELED));
        let blocked = queue.read(IssueStatus::Blocked, "001-a.md");
        assert!(blocked.contains("- reason: codex_interrupted"));
        queue.assert_consistent();
    }

    #[test]
    fn claim_race_loser_skips() {
        let queue = TestQueue::new();
        let executor = ScriptedExecutor::new(Vec::new());
        let validation = ScriptedValidation::passing();
        let cancel = CancelToken::new();
        let outcome =
            process_issue(&deps(&queue, &executor, &validation, &cancel), &fast_profile(), "gone.md")
                .expect("process");
        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(executor.calls(), 0);
    }
}
