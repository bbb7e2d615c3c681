//! Startup checks. A failure here aborts the run: no progress is possible.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::io::config::Profile;
use crate::io::paths::QueuePaths;

/// Commands the profile needs on `PATH` (or as explicit paths).
pub fn required_commands(profile: &Profile) -> Vec<String> {
    let mut commands = vec![profile.codex.binary.clone()];
    let uses_shell = profile.validation.command.is_some()
        || !profile.validation.roles.is_empty()
        || profile.busy_wait.self_heal_command.is_some()
        || profile.busy_wait.doctor_command.is_some();
    if uses_shell {
        commands.push("sh".to_string());
    }
    commands
}

/// Resolve `command` the way a shell would: explicit paths as-is, bare
/// names through `PATH`.
pub fn find_command(command: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = path_var?;
    env::split_paths(path_var)
        .map(|dir| dir.join(command))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

pub fn check_commands(profile: &Profile) -> Result<()> {
    let path_var = env::var_os("PATH");
    let missing: Vec<String> = required_commands(profile)
        .into_iter()
        .filter(|cmd| find_command(cmd, path_var.as_deref()).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!(
            "required commands not found: {}",
            missing.join(", ")
        ));
    }
    Ok(())
}

/// Create every queue, state and log directory and prove it is writable.
pub fn check_directories(paths: &QueuePaths) -> Result<()> {
    for dir in paths.writable_dirs() {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let marker = dir.join(".write-check");
        fs::write(&marker, b"ok").with_context(|| format!("write check file in {}", dir.display()))?;
        fs::remove_file(&marker).with_context(|| format!("remove check file in {}", dir.display()))?;
        debug!(dir = %dir.display(), "directory writable");
    }
    Ok(())
}

pub fn run_preflight(profile: &Profile, paths: &QueuePaths) -> Result<()> {
    check_commands(profile)?;
    check_directories(paths)?;
    info!(root = %paths.root.display(), "preflight passed");
    Ok(())
}
