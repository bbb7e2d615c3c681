//! Long-running loop for `issueloop run`.
//!
//! One pass per iteration: cancellation, enabled flag, profile reload,
//! circuit gate, watchdog, max-loops, then either the idle path or exactly
//! one processed issue. All loop state lives in [`LoopContext`] and is
//! persisted at fixed checkpoints.

use std::io::ErrorKind;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::core::backoff::permission_backoff;
use crate::core::busy_wait::{BusyWaitState, QueueCounts};
use crate::core::circuit::{CircuitBreakerState, Transition};
use crate::core::classifier::is_permission_like;
use crate::core::selector::RoleFilter;
use crate::core::types::{IssueProcessResult, Outcome};
use crate::io::busy_wait_store::load_busy_wait;
use crate::io::circuit_store::{load_circuit, save_circuit};
use crate::io::config::{Profile, ProfileSource, ReloadMeta, load_reload_meta, write_reload_meta};
use crate::io::control::EnabledFlag;
use crate::io::executor::{CodexExecutor, Executor};
use crate::io::store::IssueStore;
use crate::io::validation::ValidationRunner;
use crate::self_heal::{CommandDoctor, Doctor, IdleAction, SelfHealDeps, on_idle};
use crate::step::{StepDeps, StepOutcome, process_issue};
use crate::watchdog::run_watchdog;

/// Role that may own busy-wait detection inside a role-scoped worker.
pub const MANAGER_ROLE: &str = "manager";

/// Why `run_loop` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    Canceled,
    /// `max_loops` issues were processed.
    MaxLoops,
    /// Nothing to pick and `exit_on_idle` is set.
    Idle,
    /// `no_ready_max_loops` consecutive idle iterations.
    NoReadyMaxLoops,
}

impl LoopStop {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopStop::Canceled => "canceled",
            LoopStop::MaxLoops => "max_loops",
            LoopStop::Idle => "idle",
            LoopStop::NoReadyMaxLoops => "no_ready_max_loops",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub done: u64,
    pub blocked: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub processed: u64,
    pub stats: LoopStats,
    pub stop: LoopStop,
}

/// Command-line scoping and overrides.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub roles: RoleFilter,
    pub busy_wait_owner: bool,
    pub exit_on_idle: Option<bool>,
    pub max_loops: Option<u64>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self::new(RoleFilter::any(), false)
    }
}

impl LoopOptions {
    /// Unscoped loops own busy-wait detection, as do workers granted `manager`.
    pub fn new(roles: RoleFilter, force_owner: bool) -> Self {
        let busy_wait_owner = force_owner || !roles.is_scoped() || roles.contains(MANAGER_ROLE);
        Self {
            roles,
            busy_wait_owner,
            exit_on_idle: None,
            max_loops: None,
        }
    }

    fn apply(&self, profile: &mut Profile) {
        if let Some(exit_on_idle) = self.exit_on_idle {
            profile.looping.exit_on_idle = exit_on_idle;
        }
        if let Some(max_loops) = self.max_loops {
            profile.looping.max_loops = max_loops;
        }
    }
}

/// Collaborators. `None` executor/doctor means "build from the active profile".
pub struct LoopDeps<'a> {
    pub store: &'a IssueStore,
    pub profiles: &'a dyn ProfileSource,
    pub enabled: &'a dyn EnabledFlag,
    pub executor: Option<&'a dyn Executor>,
    pub validation: &'a dyn ValidationRunner,
    pub doctor: Option<&'a dyn Doctor>,
    pub cancel: &'a CancelToken,
}

/// Loop-owned state threaded through every iteration.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub profile: Profile,
    pub circuit: CircuitBreakerState,
    pub busy_wait: BusyWaitState,
    pub reload: ReloadMeta,
    pub loop_count: u64,
    pub idle_count: u64,
    pub tick_count: u64,
    pub permission_err_streak: u32,
    pub stats: LoopStats,
    circuit_open_logged: bool,
    disabled_logged: bool,
    reload_error: Option<String>,
}

impl LoopContext {
    pub fn new(profile: Profile, circuit: CircuitBreakerState, busy_wait: BusyWaitState) -> Self {
        Self {
            profile,
            circuit,
            busy_wait,
            reload: ReloadMeta::default(),
            loop_count: 0,
            idle_count: 0,
            tick_count: 0,
            permission_err_streak: 0,
            stats: LoopStats::default(),
            circuit_open_logged: false,
            disabled_logged: false,
            reload_error: None,
        }
    }

    fn outcome(&self, stop: LoopStop) -> LoopOutcome {
        LoopOutcome {
            processed: self.loop_count,
            stats: self.stats,
            stop,
        }
    }
}

/// Load loop state and run until a stop condition or cancellation.
pub fn run_loop(deps: &LoopDeps<'_>, options: &LoopOptions) -> Result<LoopOutcome> {
    let paths = deps.store.paths();
    let mut profile = deps.profiles.load()?;
    options.apply(&mut profile);

    let circuit = load_circuit(&paths.circuit_path).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "unreadable circuit state, starting closed");
        CircuitBreakerState::default()
    });
    let busy_wait = load_busy_wait(&paths.busy_wait_state_path).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "unreadable busy-wait state, starting fresh");
        BusyWaitState::default()
    });
    let mut ctx = LoopContext::new(profile, circuit, busy_wait);
    ctx.reload = load_reload_meta(&paths.reload_meta_path).unwrap_or_default();

    if ctx.profile.looping.recover_on_start && options.busy_wait_owner {
        match deps.store.recover_all(Utc::now()) {
            Ok(recovered) if !recovered.is_empty() => {
                info!(count = recovered.len(), "recovered in-progress issues at startup");
            }
            Ok(_) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "startup recovery failed"),
        }
    }

    info!(
        roles = ?options.roles,
        busy_wait_owner = options.busy_wait_owner,
        summary = %ctx.profile.summary(),
        "loop starting"
    );
    loop {
        if let Some(stop) = iterate(deps, options, &mut ctx)? {
            info!(?stop, processed = ctx.loop_count, "loop stopped");
            return Ok(ctx.outcome(stop));
        }
    }
}

/// One loop pass. `Some(stop)` ends the loop.
pub fn iterate(
    deps: &LoopDeps<'_>,
    options: &LoopOptions,
    ctx: &mut LoopContext,
) -> Result<Option<LoopStop>> {
    if deps.cancel.is_canceled() {
        info!("cancellation requested");
        return Ok(Some(LoopStop::Canceled));
    }
    ctx.tick_count += 1;

    if !check_enabled(deps, ctx) {
        return Ok(sleep_or_cancel(deps.cancel, ctx.profile.idle_interval()));
    }

    reload_profile(deps, options, ctx);

    let now = Utc::now();
    if ctx.circuit.is_open(now) {
        if !ctx.circuit_open_logged {
            warn!(
                open_until = ?ctx.circuit.open_until,
                last_failure = ctx.circuit.last_failure.as_deref().unwrap_or("-"),
                "circuit open, pausing agent invocations"
            );
            ctx.circuit_open_logged = true;
        }
        return Ok(sleep_or_cancel(deps.cancel, ctx.profile.idle_interval()));
    }
    if ctx.circuit_open_logged {
        info!("circuit closed, resuming agent invocations");
        ctx.circuit_open_logged = false;
    }

    if let Err(err) = run_watchdog(deps.store, &ctx.profile.watchdog, ctx.tick_count, now) {
        warn!(err = %format!("{err:#}"), "watchdog scan failed");
    }

    let max_loops = ctx.profile.looping.max_loops;
    if max_loops > 0 && ctx.loop_count >= max_loops {
        return Ok(Some(LoopStop::MaxLoops));
    }

    let picked = match deps.store.pick_next_ready(&options.roles) {
        Ok(picked) => picked,
        Err(err) => return Ok(processing_error(deps.cancel, ctx, &err)),
    };
    match picked {
        None => Ok(idle(deps, options, ctx)),
        Some(issue) => {
            ctx.idle_count = 0;
            work(deps, ctx, &issue.name)
        }
    }
}

fn check_enabled(deps: &LoopDeps<'_>, ctx: &mut LoopContext) -> bool {
    let enabled = deps.enabled.is_enabled().unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "cannot read enabled flag, assuming enabled");
        true
    });
    if enabled && ctx.disabled_logged {
        info!("loop re-enabled");
        ctx.disabled_logged = false;
    } else if !enabled && !ctx.disabled_logged {
        info!("loop disabled, waiting");
        ctx.disabled_logged = true;
    }
    enabled
}

fn reload_profile(deps: &LoopDeps<'_>, options: &LoopOptions, ctx: &mut LoopContext) {
    let mut next = match deps.profiles.load() {
        Ok(next) => next,
        Err(err) => {
            let message = format!("{err:#}");
            if ctx.reload_error.as_deref() != Some(message.as_str()) {
                warn!(err = %message, "profile reload failed, keeping previous profile");
                ctx.reload_error = Some(message);
            }
            return;
        }
    };
    ctx.reload_error = None;
    options.apply(&mut next);
    if next == ctx.profile {
        return;
    }

    let changed = next.changed_sections(&ctx.profile);
    info!(changed = ?changed, summary = %next.summary(), "profile reloaded");
    ctx.reload = ReloadMeta {
        reloaded_at: Some(Utc::now()),
        reload_count: ctx.reload.reload_count + 1,
        changed: changed.iter().map(|s| s.to_string()).collect(),
        summary: next.summary(),
    };
    if let Err(err) = write_reload_meta(&deps.store.paths().reload_meta_path, &ctx.reload) {
        warn!(err = %format!("{err:#}"), "failed to write reload metadata");
    }
    ctx.profile = next;
}

fn idle(deps: &LoopDeps<'_>, options: &LoopOptions, ctx: &mut LoopContext) -> Option<LoopStop> {
    ctx.idle_count += 1;
    let counts = deps.store.queue_counts().unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "cannot count queue");
        QueueCounts::default()
    });
    debug!(idle_count = ctx.idle_count, ready = counts.ready, in_progress = counts.in_progress, "no ready issue");

    let command_doctor = profile_doctor(deps, &ctx.profile);
    let doctor: Option<&dyn Doctor> = match (deps.doctor, &command_doctor) {
        (Some(doctor), _) => Some(doctor),
        (None, Some(doctor)) => Some(doctor),
        (None, None) => None,
    };
    let heal = SelfHealDeps {
        store: deps.store,
        doctor,
        cancel: deps.cancel,
    };
    let action = on_idle(
        &heal,
        &ctx.profile,
        &mut ctx.busy_wait,
        options.busy_wait_owner,
        ctx.idle_count,
        counts,
        Utc::now(),
    );
    if action == IdleAction::RetryNow {
        info!("self-heal produced ready work, retrying immediately");
        return None;
    }

    if ctx.profile.looping.exit_on_idle {
        return Some(LoopStop::Idle);
    }
    let limit = ctx.profile.looping.no_ready_max_loops;
    if limit > 0 && ctx.idle_count >= limit {
        return Some(LoopStop::NoReadyMaxLoops);
    }
    sleep_or_cancel(deps.cancel, ctx.profile.idle_interval())
}

fn profile_doctor(deps: &LoopDeps<'_>, profile: &Profile) -> Option<CommandDoctor> {
    let command = profile.busy_wait.doctor_command.as_ref()?;
    let paths = deps.store.paths();
    Some(CommandDoctor {
        command: command.clone(),
        workdir: paths.project_dir().to_path_buf(),
        log_path: paths.self_heal_log_path.clone(),
        timeout: Duration::from_secs(profile.busy_wait.self_heal_timeout_secs),
    })
}

fn work(deps: &LoopDeps<'_>, ctx: &mut LoopContext, name: &str) -> Result<Option<LoopStop>> {
    let codex = CodexExecutor::from_profile(&ctx.profile.codex);
    let executor: &dyn Executor = match deps.executor {
        Some(executor) => executor,
        None => &codex,
    };
    let step = StepDeps {
        store: deps.store,
        executor,
        validation: deps.validation,
        cancel: deps.cancel,
    };
    match process_issue(&step, &ctx.profile, name) {
        Ok(StepOutcome::Skipped) => Ok(None),
        Ok(StepOutcome::Processed { result, .. }) => {
            ctx.permission_err_streak = 0;
            ctx.loop_count += 1;
            match result.outcome {
                Outcome::Done => ctx.stats.done += 1,
                Outcome::Blocked => ctx.stats.blocked += 1,
                Outcome::Requeued => ctx.stats.requeued += 1,
            }
            update_circuit(deps, ctx, &result, Utc::now());
            Ok(None)
        }
        Err(err) => Ok(processing_error(deps.cancel, ctx, &err)),
    }
}

/// Fold one processed issue into the breaker and persist it.
fn update_circuit(
    deps: &LoopDeps<'_>,
    ctx: &mut LoopContext,
    result: &IssueProcessResult,
    now: DateTime<Utc>,
) {
    if result.canceled {
        return;
    }
    let reason = result.failure_reason.as_deref().unwrap_or("unknown");
    if !result.codex_failure {
        ctx.circuit.record_success(now);
    } else if result.codex_retryable {
        let threshold = ctx.profile.circuit.threshold;
        let cooldown = ctx.profile.circuit_cooldown();
        if ctx.circuit.record_retryable_failure(reason, now, threshold, cooldown) == Transition::Opened
        {
            warn!(
                consecutive_failures = ctx.circuit.consecutive_failures,
                open_until = ?ctx.circuit.open_until,
                reason,
                "circuit opened"
            );
        }
    } else {
        ctx.circuit.record_terminal_failure(reason);
    }
    if let Err(err) = save_circuit(&deps.store.paths().circuit_path, &ctx.circuit) {
        warn!(err = %format!("{err:#}"), "failed to persist circuit state");
    }
}

/// Bookkeeping failure: permission-like errors back off exponentially,
/// anything else waits one idle interval.
fn processing_error(
    cancel: &CancelToken,
    ctx: &mut LoopContext,
    err: &anyhow::Error,
) -> Option<LoopStop> {
    if is_permission_error(err) {
        ctx.permission_err_streak = ctx.permission_err_streak.saturating_add(1);
        let wait = permission_backoff(ctx.permission_err_streak);
        warn!(
            err = %format!("{err:#}"),
            streak = ctx.permission_err_streak,
            wait_secs = wait.as_secs(),
            "permission error while processing, backing off"
        );
        return sleep_or_cancel(cancel, wait);
    }
    ctx.permission_err_streak = 0;
    warn!(err = %format!("{err:#}"), "error while processing issue");
    sleep_or_cancel(cancel, ctx.profile.idle_interval())
}

/// Permission-like: an `io::Error` of a permission kind anywhere in the
/// chain, or a known marker in the rendered message.
pub fn is_permission_error(err: &anyhow::Error) -> bool {
    let io_kind = err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem
            )
        })
    });
    io_kind || is_permission_like(&format!("{err:#}"))
}

fn sleep_or_cancel(cancel: &CancelToken, duration: Duration) -> Option<LoopStop> {
    if cancel.sleep(duration) {
        None
    } else {
        Some(LoopStop::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IssueStatus;
    use crate::io::config::StaticProfileSource;
    use crate::io::control::AlwaysEnabled;
    use crate::test_support::{
        CancelAfterPolls, ScriptedExecutor, ScriptedRun, ScriptedValidation, SequenceProfiles,
        TestQueue,
    };
    use anyhow::anyhow;

    fn fast_profile() -> Profile {
        let mut profile = Profile::default();
        profile.codex.backoff_base_secs = 0;
        profile.looping.idle_interval_secs = 0;
        profile.looping.exit_on_idle = true;
        profile
    }

    fn run(
        queue: &TestQueue,
        profiles: &dyn ProfileSource,
        enabled: &dyn EnabledFlag,
        executor: &ScriptedExecutor,
        cancel: &CancelToken,
        options: &LoopOptions,
    ) -> LoopOutcome {
        let validation = ScriptedValidation::passing();
        let deps = LoopDeps {
            store: queue.store(),
            profiles,
            enabled,
            executor: Some(executor),
            validation: &validation,
            doctor: None,
            cancel,
        };
        run_loop(&deps, options).expect("loop")
    }

    #[test]
    fn drains_queue_in_priority_order_then_exits_idle() {
        let queue = TestQueue::new();
        queue.add_ready("001-low.md", "id: LOW\nstatus: ready\npriority: 1000\n");
        queue.add_ready("002-high.md", "id: HIGH\nstatus: ready\npriority: 500\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success(), ScriptedRun::success()]);
        let profiles = StaticProfileSource(fast_profile());

        let outcome = run(
            &queue,
            &profiles,
            &AlwaysEnabled,
            &executor,
            &CancelToken::new(),
            &LoopOptions::default(),
        );
        assert_eq!(outcome.stop, LoopStop::Idle);
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.stats.done, 2);
        assert!(executor.prompts()[0].contains("### Issue HIGH"));
        assert_eq!(queue.store().count(IssueStatus::Done).expect("count"), 2);
        queue.assert_consistent();
    }

    #[test]
    fn max_loops_stops_after_processing() {
        let queue = TestQueue::new();
        queue.add_ready("001.md", "status: ready\n");
        queue.add_ready("002.md", "status: ready\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let profiles = StaticProfileSource(fast_profile());
        let options = LoopOptions {
            max_loops: Some(1),
            ..LoopOptions::default()
        };

        let outcome = run(&queue, &profiles, &AlwaysEnabled, &executor, &CancelToken::new(), &options);
        assert_eq!(outcome.stop, LoopStop::MaxLoops);
        assert_eq!(outcome.processed, 1);
        assert_eq!(queue.store().count(IssueStatus::Ready).expect("count"), 1);
    }

    #[test]
    fn retryable_failures_open_circuit_and_pause() {
        let queue = TestQueue::new();
        for name in ["001.md", "002.md", "003.md"] {
            queue.add_ready(name, "status: ready\n");
        }
        let mut profile = fast_profile();
        profile.codex.attempts = 1;
        profile.circuit.threshold = 2;
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::failure("codex_timeout_5s", true),
            ScriptedRun::failure("codex_timeout_5s", true),
            ScriptedRun::success(),
        ]);
        let cancel = CancelToken::new();
        let enabled = CancelAfterPolls::new(cancel.clone(), 6);
        let profiles = StaticProfileSource(profile);

        let outcome = run(&queue, &profiles, &enabled, &executor, &cancel, &LoopOptions::default());
        assert_eq!(outcome.stop, LoopStop::Canceled);
        assert_eq!(outcome.processed, 2);
        assert_eq!(executor.calls(), 2);
        assert_eq!(queue.store().count(IssueStatus::Ready).expect("count"), 1);

        let circuit = load_circuit(&queue.store().paths().circuit_path).expect("circuit");
        assert_eq!(circuit.consecutive_failures, 2);
        assert!(circuit.is_open(Utc::now()));
    }

    #[test]
    fn terminal_failure_resets_failure_streak() {
        let queue = TestQueue::new();
        queue.add_ready("001.md", "status: ready\n");
        queue.add_ready("002.md", "status: ready\n");
        let mut profile = fast_profile();
        profile.codex.attempts = 1;
        let executor = ScriptedExecutor::new(vec![
            ScriptedRun::failure("codex_exit_1", true),
            ScriptedRun::failure("codex_auth_error", false),
        ]);
        let profiles = StaticProfileSource(profile);

        let outcome = run(
            &queue,
            &profiles,
            &AlwaysEnabled,
            &executor,
            &CancelToken::new(),
            &LoopOptions::default(),
        );
        assert_eq!(outcome.stats.blocked, 2);
        let circuit = load_circuit(&queue.store().paths().circuit_path).expect("circuit");
        assert_eq!(circuit.consecutive_failures, 0);
        assert_eq!(circuit.last_failure.as_deref(), Some("codex_auth_error"));
        assert!(!circuit.is_open(Utc::now()));
    }

    #[test]
    fn disabled_flag_blocks_work_until_cancel() {
        let queue = TestQueue::new();
        queue.add_ready("001.md", "status: ready\n");
        queue.disable();
        let executor = ScriptedExecutor::new(Vec::new());
        let cancel = CancelToken::new();
        let profiles = StaticProfileSource(fast_profile());
        let enabled = CancelAfterPolls::wrapping(cancel.clone(), 3, queue.enabled_flag());

        let outcome = run(&queue, &profiles, &enabled, &executor, &cancel, &LoopOptions::default());
        assert_eq!(outcome.stop, LoopStop::Canceled);
        assert_eq!(executor.calls(), 0);
        assert_eq!(queue.store().count(IssueStatus::Ready).expect("count"), 1);
    }

    #[test]
    fn reload_applies_new_settings_mid_run() {
        let queue = TestQueue::new();
        let mut first = fast_profile();
        first.looping.exit_on_idle = false;
        first.looping.no_ready_max_loops = 0;
        let mut second = first.clone();
        second.looping.no_ready_max_loops = 3;
        let cancel = CancelToken::new();
        // Start load + reload on pass 1 use `first`; pass 2 onwards sees `second`.
        let profiles = SequenceProfiles::new(vec![first.clone(), first, second]);
        let enabled = CancelAfterPolls::new(cancel.clone(), 50);
        let executor = ScriptedExecutor::new(Vec::new());

        let outcome = run(&queue, &profiles, &enabled, &executor, &cancel, &LoopOptions::default());
        assert_eq!(outcome.stop, LoopStop::NoReadyMaxLoops);
        let meta = load_reload_meta(&queue.store().paths().reload_meta_path).expect("meta");
        assert_eq!(meta.reload_count, 1);
        assert_eq!(meta.changed, vec!["loop".to_string()]);
    }

    #[test]
    fn canceled_issue_does_not_touch_circuit() {
        let queue = TestQueue::new();
        queue.add_ready("001.md", "status: ready\n");
        let cancel = CancelToken::new();
        let executor = ScriptedExecutor::new(vec![ScriptedRun::failure(
            crate::core::classifier::REASON_CANCELED,
            false,
        )])
        .cancel_on_exec(cancel.clone());
        let profiles = StaticProfileSource(fast_profile());

        let outcome = run(&queue, &profiles, &AlwaysEnabled, &executor, &cancel, &LoopOptions::default());
        assert_eq!(outcome.stop, LoopStop::Canceled);
        assert_eq!(outcome.stats.requeued, 1);
        assert!(!queue.store().paths().circuit_path.exists());
        assert_eq!(queue.store().count(IssueStatus::Ready).expect("count"), 1);
    }

    #[test]
    fn interrupt_without_cancellation_is_recorded_as_agent_failure() {
        let queue = TestQueue::new();
        queue.add_ready("001.md", "status: ready\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::failure(
            crate::core::classifier::REASON_CANCELED,
            false,
        )]);
        let profiles = StaticProfileSource(fast_profile());

        let outcome = run(
            &queue,
            &profiles,
            &AlwaysEnabled,
            &executor,
            &CancelToken::new(),
            &LoopOptions::default(),
        );
        assert_eq!(outcome.stop, LoopStop::Idle);
        assert_eq!(outcome.stats.blocked, 1);
        assert_eq!(outcome.stats.requeued, 0);
        assert_eq!(executor.calls(), 1);
        assert_eq!(queue.store().names(IssueStatus::Blocked).expect("blocked"), vec!["001.md"]);

        let circuit = load_circuit(&queue.store().paths().circuit_path).expect("circuit");
        assert_eq!(
            circuit.last_failure.as_deref(),
            Some(crate::core::classifier::REASON_INTERRUPTED)
        );
        assert_eq!(circuit.consecutive_failures, 0);
    }

    #[test]
    fn startup_recovery_returns_in_progress_work() {
        let queue = TestQueue::new();
        queue.add(IssueStatus::InProgress, "001.md", "status: in-progress\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let profiles = StaticProfileSource(fast_profile());

        let outcome = run(
            &queue,
            &profiles,
            &AlwaysEnabled,
            &executor,
            &CancelToken::new(),
            &LoopOptions::default(),
        );
        assert_eq!(outcome.stats.done, 1);
        assert_eq!(queue.store().count(IssueStatus::InProgress).expect("count"), 0);
    }

    #[test]
    fn failed_startup_recovery_does_not_stop_the_loop() {
        let queue = TestQueue::new();
        let in_progress = queue.store().dir(IssueStatus::InProgress);
        std::fs::remove_dir(&in_progress).expect("remove in-progress dir");
        std::fs::write(&in_progress, "not a directory").expect("block in-progress dir");
        assert!(queue.store().recover_all(Utc::now()).is_err());

        let executor = ScriptedExecutor::new(Vec::new());
        let profiles = StaticProfileSource(fast_profile());
        let outcome = run(
            &queue,
            &profiles,
            &AlwaysEnabled,
            &executor,
            &CancelToken::new(),
            &LoopOptions::default(),
        );
        assert_eq!(outcome.stop, LoopStop::Idle);
        assert_eq!(outcome.processed, 0);
        assert_eq!(executor.calls(), 0);
    }

    #[test]
    fn role_scoped_worker_only_picks_its_role() {
        let queue = TestQueue::new();
        queue.add_ready("001.md", "role: qa\nstatus: ready\n");
        queue.add_ready("002.md", "role: developer\nstatus: ready\n");
        let executor = ScriptedExecutor::new(vec![ScriptedRun::success()]);
        let profiles = StaticProfileSource(fast_profile());
        let options = LoopOptions::new(RoleFilter::only(["developer"]), false);
        assert!(!options.busy_wait_owner);

        let outcome = run(&queue, &profiles, &AlwaysEnabled, &executor, &CancelToken::new(), &options);
        assert_eq!(outcome.processed, 1);
        let ready = queue.store().names(IssueStatus::Ready).expect("names");
        assert_eq!(ready, vec!["001.md".to_string()]);
    }

    #[test]
    fn busy_wait_ownership() {
        assert!(LoopOptions::new(RoleFilter::any(), false).busy_wait_owner);
        assert!(LoopOptions::new(RoleFilter::only(["manager", "qa"]), false).busy_wait_owner);
        assert!(LoopOptions::new(RoleFilter::only(["qa"]), true).busy_wait_owner);
    }

    #[test]
    fn permission_errors_are_recognized() {
        let io = std::io::Error::new(ErrorKind::PermissionDenied, "nope");
        let err = anyhow::Error::new(io).context("rename a -> b");
        assert!(is_permission_error(&err));
        assert!(is_permission_error(&anyhow!("write: Read-only file system")));
        assert!(!is_permission_error(&anyhow!("disk full")));
    }
}
