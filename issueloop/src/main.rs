//! Autonomous issue-queue runner.
//!
//! Works through `.issueloop/issues/ready/` one issue at a time with
//! `codex exec`, moving each issue to `done/`, `blocked/`, or back to
//! `ready/` according to the completion gate.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use issueloop::cancel::CancelToken;
use issueloop::core::selector::RoleFilter;
use issueloop::core::types::IssueStatus;
use issueloop::exit_codes;
use issueloop::io::circuit_store::load_circuit;
use issueloop::io::config::{FileProfileSource, Profile, ProfileSource, write_profile};
use issueloop::io::control::{EnabledFlag, FileEnabledFlag};
use issueloop::io::paths::QueuePaths;
use issueloop::io::preflight::{check_directories, run_preflight};
use issueloop::io::store::IssueStore;
use issueloop::io::validation::ShellValidationRunner;
use issueloop::logging;
use issueloop::looping::{LoopDeps, LoopOptions, run_loop};
use tracing::error;

#[derive(Parser)]
#[command(
    name = "issueloop",
    version,
    about = "Autonomous issue-queue runner for codex"
)]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.issueloop/` directories and a default profile if missing.
    Init {
        /// Overwrite an existing profile.
        #[arg(short, long)]
        force: bool,
    },
    /// Process issues until idle, a loop limit, or Ctrl+C.
    Run {
        /// Only claim issues with this role (repeatable).
        #[arg(long = "role")]
        roles: Vec<String>,
        /// Exit as soon as no ready issue matches.
        #[arg(long)]
        exit_on_idle: bool,
        /// Stop after processing N issues.
        #[arg(long)]
        max_loops: Option<u64>,
        /// Run busy-wait detection even in a role-scoped worker.
        #[arg(long)]
        busy_wait_owner: bool,
    },
    /// Return in-progress issues to `ready/`.
    Recover {
        /// Only recover issues untouched for this many seconds.
        #[arg(long)]
        stale_secs: Option<u64>,
    },
    /// Print queue counts and circuit state.
    Status,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let project = match cli.project {
        Some(project) => project,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let paths = QueuePaths::new(project);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Run {
            roles,
            exit_on_idle,
            max_loops,
            busy_wait_owner,
        } => {
            let mut options = LoopOptions::new(RoleFilter::only(roles), busy_wait_owner);
            options.exit_on_idle = exit_on_idle.then_some(true);
            options.max_loops = max_loops;
            cmd_run(paths, &options)
        }
        Command::Recover { stale_secs } => cmd_recover(paths, stale_secs),
        Command::Status => cmd_status(paths),
    }
}

fn cmd_init(paths: &QueuePaths, force: bool) -> Result<i32> {
    check_directories(paths)?;
    if force || !paths.profile_path.exists() {
        write_profile(&paths.profile_path, &Profile::default())?;
        println!("wrote {}", paths.profile_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(paths: QueuePaths, options: &LoopOptions) -> Result<i32> {
    let profiles = FileProfileSource {
        path: paths.profile_path.clone(),
    };
    let profile = profiles.load()?;
    if let Err(err) = run_preflight(&profile, &paths) {
        error!(err = %format!("{err:#}"), "preflight failed");
        eprintln!("preflight failed: {err:#}");
        return Ok(exit_codes::PREFLIGHT);
    }

    let cancel = CancelToken::new();
    cancel.install_ctrlc()?;
    let enabled = FileEnabledFlag {
        path: paths.enabled_path.clone(),
    };
    let store = IssueStore::new(paths);
    let deps = LoopDeps {
        store: &store,
        profiles: &profiles,
        enabled: &enabled,
        executor: None,
        validation: &ShellValidationRunner,
        doctor: None,
        cancel: &cancel,
    };
    let outcome = run_loop(&deps, options)?;
    println!(
        "processed={} done={} blocked={} requeued={} stop={}",
        outcome.processed,
        outcome.stats.done,
        outcome.stats.blocked,
        outcome.stats.requeued,
        outcome.stop.as_str()
    );
    Ok(exit_codes::OK)
}

fn cmd_recover(paths: QueuePaths, stale_secs: Option<u64>) -> Result<i32> {
    let store = IssueStore::new(paths);
    store.ensure_dirs()?;
    let now = Utc::now();
    let recovered = match stale_secs {
        Some(secs) => store.recover_stale(Duration::from_secs(secs), now)?,
        None => store.recover_all(now)?,
    };
    for r in &recovered {
        println!("{} -> {}", r.from, r.to);
    }
    println!("recovered={}", recovered.len());
    Ok(exit_codes::OK)
}

fn cmd_status(paths: QueuePaths) -> Result<i32> {
    let enabled = FileEnabledFlag {
        path: paths.enabled_path.clone(),
    }
    .is_enabled()?;
    let circuit = load_circuit(&paths.circuit_path)?;
    let store = IssueStore::new(paths);
    for status in IssueStatus::ALL {
        println!("{status}: {}", store.count(status)?);
    }
    println!("enabled: {enabled}");
    let now = Utc::now();
    match circuit.open_until {
        Some(until) if circuit.is_open(now) => println!("circuit: open until {}", until.to_rfc3339()),
        _ => println!("circuit: closed"),
    }
    println!("consecutive_failures: {}", circuit.consecutive_failures);
    println!(
        "last_failure: {}",
        circuit.last_failure.as_deref().unwrap_or("none")
    );
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["issueloop", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_run_with_roles_and_limits() {
        let cli = Cli::parse_from([
            "issueloop",
            "run",
            "--project",
            "/work",
            "--role",
            "qa",
            "--role",
            "developer",
            "--exit-on-idle",
            "--max-loops",
            "5",
        ]);
        assert_eq!(cli.project, Some(PathBuf::from("/work")));
        match cli.command {
            Command::Run {
                roles,
                exit_on_idle,
                max_loops,
                busy_wait_owner,
            } => {
                assert_eq!(roles, vec!["qa".to_string(), "developer".to_string()]);
                assert!(exit_on_idle);
                assert_eq!(max_loops, Some(5));
                assert!(!busy_wait_owner);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_recover_stale() {
        let cli = Cli::parse_from(["issueloop", "recover", "--stale-secs", "600"]);
        assert!(matches!(
            cli.command,
            Command::Recover {
                stale_secs: Some(600)
            }
        ));
    }

    #[test]
    fn parse_status() {
        let cli = Cli::parse_from(["issueloop", "status"]);
        assert!(matches!(cli.command, Command::Status));
    }
}
