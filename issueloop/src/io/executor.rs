//! Agent invocation with retry, backoff, and failure classification.
//!
//! The [`Executor`] trait decouples issue processing from the actual agent
//! backend (`codex exec`). Tests use scripted executors that return
//! predetermined outcomes without spawning processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::backoff::codex_backoff;
use crate::core::classifier::{
    DEFAULT_RULES, FailureRule, REASON_CANCELED, classify_exit, exhausted_reason, timeout_reason,
};
use crate::io::process::{RunOptions, run_command};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Project directory the agent works in.
    pub workdir: PathBuf,
    /// Prompt text, fed on stdin.
    pub prompt: String,
    pub model: String,
    /// Where the agent writes its final message.
    pub last_message_path: Option<PathBuf>,
    /// Run log; every attempt appends to it.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub tail_bytes: usize,
}

/// Classified agent failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct CodexError {
    pub reason: String,
    pub retryable: bool,
    /// Reason of the last attempt when `reason` is a composite.
    pub cause: Option<String>,
    pub exit_code: Option<i32>,
}

impl CodexError {
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
            cause: None,
            exit_code: None,
        }
    }

    pub fn canceled() -> Self {
        Self::new(REASON_CANCELED, false)
    }

    pub fn is_canceled(&self) -> bool {
        self.reason == REASON_CANCELED
    }
}

/// Abstraction over agent backends. One call is one attempt.
pub trait Executor {
    fn exec(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<(), CodexError>;
}

/// Executor that spawns `codex exec` with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CodexExecutor {
    pub binary: String,
    pub sandbox: String,
    pub approval: String,
    pub extra_args: Vec<String>,
    pub rules: &'static [FailureRule],
}

impl CodexExecutor {
    pub fn from_profile(codex: &crate::io::config::CodexConfig) -> Self {
        Self {
            binary: codex.binary.clone(),
            sandbox: codex.sandbox.clone(),
            approval: codex.approval.clone(),
            extra_args: codex.extra_args.clone(),
            rules: DEFAULT_RULES,
        }
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg("--model")
            .arg(&request.model)
            .arg("--sandbox")
            .arg(&self.sandbox)
            .arg("-c")
            .arg(format!("approval_policy=\"{}\"", self.approval))
            .arg("--skip-git-repo-check")
            .arg("--cd")
            .arg(&request.workdir);
        if let Some(path) = &request.last_message_path {
            cmd.arg("--output-last-message").arg(path);
        }
        cmd.args(&self.extra_args)
            .arg("-")
            .current_dir(&request.workdir);
        cmd
    }
}

impl Executor for CodexExecutor {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<(), CodexError> {
        if let Some(parent) = request.last_message_path.as_ref().and_then(|p| p.parent())
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!(err = %err, "cannot create last message directory");
        }

        let output = run_command(
            self.command(request),
            &RunOptions {
                stdin: Some(request.prompt.as_bytes()),
                timeout: request.timeout,
                tail_bytes: request.tail_bytes,
                log_path: Some(&request.log_path),
            },
            cancel,
        )
        .map_err(|err| {
            // Spawn failures: the binary is missing or not executable.
            let reason = if crate::core::classifier::is_permission_like(&format!("{err:#}")) {
                crate::core::classifier::REASON_PERMISSION
            } else {
                "codex_spawn_failed"
            };
            warn!(err = %format!("{err:#}"), reason, "codex exec could not run");
            CodexError::new(reason, false)
        })?;

        if output.canceled {
            return Err(CodexError::canceled());
        }
        if output.timed_out {
            let secs = request.timeout.as_secs();
            warn!(timeout_secs = secs, "codex exec timed out");
            return Err(CodexError::new(timeout_reason(secs), true));
        }
        if output.success() {
            debug!("codex exec completed successfully");
            return Ok(());
        }

        // Killed by a signal without our cancel flag: no exit code, treat as generic.
        let code = output.exit_code().unwrap_or(-1);
        let classified = classify_exit(self.rules, code, &output.tail);
        warn!(exit_code = code, reason = %classified.reason, retryable = classified.retryable, "codex exec failed");
        Err(CodexError {
            reason: classified.reason,
            retryable: classified.retryable,
            cause: None,
            exit_code: Some(code),
        })
    }
}

/// Retry budget for one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base_secs: u64,
}

/// Run the executor up to `policy.attempts` times, backing off between
/// retryable failures. Non-retryable failures and cancellation stop at once.
#[instrument(skip_all, fields(attempts = policy.attempts, backoff_base_secs = policy.backoff_base_secs))]
pub fn run_with_retries<E: Executor + ?Sized>(
    executor: &E,
    request: &ExecRequest,
    policy: RetryPolicy,
    cancel: &CancelToken,
) -> Result<(), CodexError> {
    let attempts = policy.attempts.max(1);
    let mut last: Option<CodexError> = None;

    for attempt in 1..=attempts {
        if cancel.is_canceled() {
            return Err(CodexError::canceled());
        }
        append_attempt_marker(request, attempt, attempts);
        info!(attempt, attempts, "invoking agent");

        let err = match executor.exec(request, cancel) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.is_canceled() || !err.retryable {
            return Err(err);
        }

        warn!(attempt, reason = %err.reason, "retryable agent failure");
        last = Some(err);
        if attempt < attempts {
            let wait = codex_backoff(policy.backoff_base_secs, attempt);
            if !wait.is_zero() {
                info!(wait_secs = wait.as_secs(), "backing off before retry");
            }
            if !cancel.sleep(wait) {
                return Err(CodexError::canceled());
            }
        }
    }

    let last = last.unwrap_or_else(|| CodexError::new(exhausted_reason(attempts), true));
    if attempts > 1 {
        return Err(CodexError {
            reason: exhausted_reason(attempts),
            retryable: true,
            cause: Some(last.reason),
            exit_code: last.exit_code,
        });
    }
    Err(last)
}

fn append_attempt_marker(request: &ExecRequest, attempt: u32, attempts: u32) {
    let result = (|| -> anyhow::Result<()> {
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)
            .with_context(|| format!("open run log {}", request.log_path.display()))?;
        writeln!(
            file,
            "=== attempt {attempt}/{attempts} model={} at {} ===",
            request.model,
            Utc::now().to_rfc3339()
        )?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!(err = %format!("{err:#}"), "failed to write run log marker");
    }
}
