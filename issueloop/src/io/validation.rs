//! Validation command adapter.
//!
//! A validation command is an arbitrary shell command run in the project
//! root after the agent finishes. Its output goes to a per-run log file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::ValidationOutcome;
use crate::io::process::{DEFAULT_TAIL_BYTES, RunOptions, run_command, shell};

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
}

pub trait ValidationRunner {
    fn run(&self, request: &ValidationRequest, cancel: &CancelToken) -> Result<ValidationOutcome>;
}

/// Runs the command through `sh -c`.
pub struct ShellValidationRunner;

impl ValidationRunner for ShellValidationRunner {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &ValidationRequest, cancel: &CancelToken) -> Result<ValidationOutcome> {
        let output = run_command(
            shell(&request.command, &request.workdir),
            &RunOptions {
                stdin: None,
                timeout: request.timeout,
                tail_bytes: DEFAULT_TAIL_BYTES,
                log_path: Some(&request.log_path),
            },
            cancel,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "validation timed out");
            return Ok(ValidationOutcome::TimedOut);
        }
        if output.success() {
            info!("validation passed");
            Ok(ValidationOutcome::Pass)
        } else {
            warn!(exit_code = ?output.exit_code(), canceled = output.canceled, "validation failed");
            Ok(ValidationOutcome::Fail)
        }
    }
}

/// Run `request` if a command applies, otherwise report `Skipped`.
pub fn run_validation_if_configured<R: ValidationRunner + ?Sized>(
    runner: &R,
    request: Option<&ValidationRequest>,
    cancel: &CancelToken,
) -> Result<ValidationOutcome> {
    match request {
        Some(request) => runner.run(request, cancel),
        None => Ok(ValidationOutcome::Skipped),
    }
}
