//! Test-only helpers: a throwaway queue plus scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::types::{IssueStatus, ValidationOutcome};
use crate::io::config::{Profile, ProfileSource, write_profile};
use crate::io::control::{AlwaysEnabled, EnabledFlag, FileEnabledFlag};
use crate::io::executor::{CodexError, ExecRequest, Executor};
use crate::io::paths::QueuePaths;
use crate::io::store::IssueStore;
use crate::io::validation::{ValidationRequest, ValidationRunner};
use crate::issue::Issue;
use crate::self_heal::{CheckStatus, Doctor, DoctorCheck};

/// Project directory in a temp dir with an initialized queue.
pub struct TestQueue {
    _temp: TempDir,
    store: IssueStore,
}

impl Default for TestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TestQueue {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("tempdir");
        let store = IssueStore::new(QueuePaths::new(temp.path()));
        store.ensure_dirs().expect("queue dirs");
        Self { _temp: temp, store }
    }

    pub fn store(&self) -> &IssueStore {
        &self.store
    }

    pub fn project_dir(&self) -> &Path {
        self.store.paths().project_dir()
    }

    pub fn add_ready(&self, name: &str, contents: &str) -> PathBuf {
        self.add(IssueStatus::Ready, name, contents)
    }

    pub fn add(&self, status: IssueStatus, name: &str, contents: &str) -> PathBuf {
        let path = self.store.dir(status).join(name);
        fs::write(&path, contents).expect("write issue");
        path
    }

    pub fn read(&self, status: IssueStatus, name: &str) -> String {
        let path = self.store.dir(status).join(name);
        fs::read_to_string(&path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
    }

    /// Name of the single file in `ready/`.
    pub fn only_ready(&self) -> String {
        let names = self.store.names(IssueStatus::Ready).expect("names");
        assert_eq!(names.len(), 1, "expected exactly one ready issue, got {names:?}");
        names[0].clone()
    }

    pub fn write_profile(&self, profile: &Profile) {
        write_profile(&self.store.paths().profile_path, profile).expect("write profile");
    }

    /// Write `0` to the enabled flag file.
    pub fn disable(&self) {
        fs::write(&self.store.paths().enabled_path, "0\n").expect("write enabled flag");
    }

    pub fn enabled_flag(&self) -> FileEnabledFlag {
        FileEnabledFlag {
            path: self.store.paths().enabled_path.clone(),
        }
    }

    /// Every issue's `status:` header, when present, names the directory it is in.
    pub fn assert_consistent(&self) {
        for status in IssueStatus::ALL {
            for name in self.store.names(status).expect("names") {
                let issue = Issue::parse(&name, &self.read(status, &name));
                if let Some(header) = issue.status {
                    assert_eq!(header, status, "{status}/{name} has status {header}");
                }
            }
        }
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    result: Result<(), CodexError>,
    last_message: Option<String>,
    files: Vec<(PathBuf, String)>,
}

impl ScriptedRun {
    pub fn success() -> Self {
        Self {
            result: Ok(()),
            last_message: None,
            files: Vec::new(),
        }
    }

    pub fn failure(reason: &str, retryable: bool) -> Self {
        Self {
            result: Err(CodexError::new(reason, retryable)),
            last_message: None,
            files: Vec::new(),
        }
    }

    pub fn with_last_message(mut self, message: &str) -> Self {
        self.last_message = Some(message.to_string());
        self
    }

    /// File the "agent" writes during the run, e.g. a handoff.
    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.files.push((path.into(), contents.to_string()));
        self
    }
}

/// Executor that replays [`ScriptedRun`]s in order and records prompts.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    runs: RefCell<VecDeque<ScriptedRun>>,
    prompts: RefCell<Vec<String>>,
    cancel_on_exec: Option<CancelToken>,
}

impl ScriptedExecutor {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            prompts: RefCell::new(Vec::new()),
            cancel_on_exec: None,
        }
    }

    /// Cancel `token` as soon as the agent is invoked.
    pub fn cancel_on_exec(mut self, token: CancelToken) -> Self {
        self.cancel_on_exec = Some(token);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn last_prompt(&self) -> String {
        self.prompts.borrow().last().cloned().unwrap_or_default()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest, _cancel: &CancelToken) -> Result<(), CodexError> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        if let Some(token) = &self.cancel_on_exec {
            token.cancel();
        }
        let Some(run) = self.runs.borrow_mut().pop_front() else {
            return Err(CodexError::new("scripted_executor_exhausted", false));
        };
        if let (Some(message), Some(path)) = (&run.last_message, &request.last_message_path) {
            write_with_parents(path, message);
        }
        for (path, contents) in &run.files {
            write_with_parents(path, contents);
        }
        run.result
    }
}

fn write_with_parents(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, contents).expect("write scripted file");
}

/// Validation runner with canned outcomes; `Pass` once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedValidation {
    outcomes: RefCell<VecDeque<ValidationOutcome>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedValidation {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn new(outcomes: Vec<ValidationOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl ValidationRunner for ScriptedValidation {
    fn run(&self, request: &ValidationRequest, _cancel: &CancelToken) -> Result<ValidationOutcome> {
        self.commands.borrow_mut().push(request.command.clone());
        Ok(self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or(ValidationOutcome::Pass))
    }
}

/// Doctor returning fixed checks or a fixed error.
#[derive(Debug, Clone)]
pub struct FakeDoctor {
    checks: Vec<CheckStatus>,
    error: Option<String>,
}

impl FakeDoctor {
    pub fn new(checks: Vec<CheckStatus>) -> Self {
        Self {
            checks,
            error: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            checks: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

impl Doctor for FakeDoctor {
    fn repair(&self, _cancel: &CancelToken) -> Result<Vec<DoctorCheck>> {
        if let Some(message) = &self.error {
            return Err(anyhow!("{message}"));
        }
        Ok(self
            .checks
            .iter()
            .enumerate()
            .map(|(i, status)| DoctorCheck {
                name: Some(format!("check-{i}")),
                status: *status,
            })
            .collect())
    }
}

/// Enabled flag that cancels `token` after `polls` reads, so tests of
/// otherwise unbounded loops terminate.
pub struct CancelAfterPolls {
    token: CancelToken,
    remaining: Cell<u32>,
    inner: Box<dyn EnabledFlag>,
}

impl CancelAfterPolls {
    pub fn new(token: CancelToken, polls: u32) -> Self {
        Self::wrapping(token, polls, AlwaysEnabled)
    }

    pub fn wrapping(token: CancelToken, polls: u32, inner: impl EnabledFlag + 'static) -> Self {
        Self {
            token,
            remaining: Cell::new(polls),
            inner: Box::new(inner),
        }
    }
}

impl EnabledFlag for CancelAfterPolls {
    fn is_enabled(&self) -> Result<bool> {
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            self.token.cancel();
        }
        self.inner.is_enabled()
    }
}

/// Profile source yielding each profile once, then repeating the last.
pub struct SequenceProfiles {
    profiles: RefCell<VecDeque<Profile>>,
}

impl SequenceProfiles {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: RefCell::new(profiles.into()),
        }
    }
}

impl ProfileSource for SequenceProfiles {
    fn load(&self) -> Result<Profile> {
        let mut profiles = self.profiles.borrow_mut();
        match profiles.len() {
            0 => Err(anyhow!("no profiles scripted")),
            1 => Ok(profiles[0].clone()),
            _ => profiles.pop_front().ok_or_else(|| anyhow!("no profiles scripted")),
        }
    }
}
