//! File-backed issue queue: `ready/`, `in-progress/`, `done/`, `blocked/`.
//!
//! Every transition is a rename followed by a status-header rewrite at the
//! destination. There is no lock: whoever renames first owns the issue, and a
//! rename whose source is gone means another worker already moved it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::busy_wait::QueueCounts;
use crate::core::selector::{RoleFilter, pick_next};
use crate::core::types::IssueStatus;
use crate::io::paths::QueuePaths;
use crate::issue::{Issue, set_status};

/// Result of trying to claim a ready issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Issue),
    /// Another worker renamed it first.
    AlreadyClaimed,
}

/// Result of moving an issue between queue directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved { name: String, path: PathBuf },
    /// The source disappeared before the rename.
    Vanished,
}

/// One issue returned from `in-progress/` to `ready/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct IssueStore {
    paths: QueuePaths,
}

impl IssueStore {
    pub fn new(paths: QueuePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &QueuePaths {
        &self.paths
    }

    pub fn dir(&self, status: IssueStatus) -> PathBuf {
        self.paths.status_dir(status)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for status in IssueStatus::ALL {
            let dir = self.dir(status);
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// File names in a queue directory, sorted. Hidden files are skipped.
    pub fn names(&self, status: IssueStatus) -> Result<Vec<String>> {
        let dir = self.dir(status);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match entry.file_type() {
                Ok(ft) if ft.is_file() => names.push(name),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn count(&self, status: IssueStatus) -> Result<usize> {
        Ok(self.names(status)?.len())
    }

    pub fn queue_counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            ready: self.count(IssueStatus::Ready)?,
            in_progress: self.count(IssueStatus::InProgress)?,
        })
    }

    /// Read and parse one issue. `None` if it vanished.
    pub fn read(&self, status: IssueStatus, name: &str) -> Result<Option<Issue>> {
        let path = self.dir(status).join(name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(Issue::parse(name, &contents))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read issue {}", path.display())),
        }
    }

    pub fn list(&self, status: IssueStatus) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        for name in self.names(status)? {
            if let Some(issue) = self.read(status, &name)? {
                issues.push(issue);
            }
        }
        Ok(issues)
    }

    /// Pick the next ready issue for `filter`, without claiming it.
    pub fn pick_next_ready(&self, filter: &RoleFilter) -> Result<Option<Issue>> {
        let ready = self.list(IssueStatus::Ready)?;
        Ok(pick_next(&ready, filter).cloned())
    }

    /// Claim a ready issue by renaming it into `in-progress/`.
    pub fn claim(&self, name: &str) -> Result<ClaimOutcome> {
        match self.move_issue(name, IssueStatus::Ready, IssueStatus::InProgress, name, |c| {
            c.to_string()
        })? {
            MoveOutcome::Moved { name, .. } => {
                match self.read(IssueStatus::InProgress, &name)? {
                    Some(issue) => {
                        debug!(issue = %issue.id, "claimed");
                        Ok(ClaimOutcome::Claimed(issue))
                    }
                    None => Ok(ClaimOutcome::AlreadyClaimed),
                }
            }
            MoveOutcome::Vanished => {
                debug!(name, "issue already claimed by another worker");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
        }
    }

    /// Rename `from/name` to `to/dest_name`, then rewrite the status header
    /// and apply `edit` to the contents at the destination.
    pub fn move_issue<F>(
        &self,
        name: &str,
        from: IssueStatus,
        to: IssueStatus,
        dest_name: &str,
        edit: F,
    ) -> Result<MoveOutcome>
    where
        F: FnOnce(&str) -> String,
    {
        let src = self.dir(from).join(name);
        let dest_dir = self.dir(to);
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("create {}", dest_dir.display()))?;
        let dest = dest_dir.join(dest_name);

        match fs::rename(&src, &dest) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(MoveOutcome::Vanished),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("rename {} -> {}", src.display(), dest.display())
                });
            }
        }

        let contents = match fs::read_to_string(&dest) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(MoveOutcome::Vanished),
            Err(err) => return Err(err).with_context(|| format!("read {}", dest.display())),
        };
        let updated = set_status(&edit(&contents), to);
        // Another worker may have moved the file on; never recreate it here.
        if !dest.is_file() {
            return Ok(MoveOutcome::Vanished);
        }
        write_atomic(&dest, &updated)?;

        Ok(MoveOutcome::Moved {
            name: dest_name.to_string(),
            path: dest,
        })
    }

    /// Move an in-progress issue back to `ready/`, renaming it if a file with
    /// the same name is already queued there.
    pub fn requeue<F>(&self, name: &str, now: DateTime<Utc>, edit: F) -> Result<MoveOutcome>
    where
        F: FnOnce(&str) -> String,
    {
        let ready_dir = self.dir(IssueStatus::Ready);
        let dest_name = if ready_dir.join(name).exists() {
            unique_name(&ready_dir, "requeued", now, name)
        } else {
            name.to_string()
        };
        self.move_issue(name, IssueStatus::InProgress, IssueStatus::Ready, &dest_name, edit)
    }

    /// Boot-time recovery: return every in-progress issue to `ready/`.
    pub fn recover_all(&self, now: DateTime<Utc>) -> Result<Vec<Recovered>> {
        self.recover_where(now, |_| true)
    }

    /// Return in-progress issues whose modification time is older than `stale_after`.
    pub fn recover_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> Result<Vec<Recovered>> {
        let wall_now = SystemTime::from(now);
        self.recover_where(now, |path| match modified(path) {
            Some(mtime) => wall_now
                .duration_since(mtime)
                .map(|age| age > stale_after)
                .unwrap_or(false),
            None => false,
        })
    }

    fn recover_where<P>(&self, now: DateTime<Utc>, mut predicate: P) -> Result<Vec<Recovered>>
    where
        P: FnMut(&Path) -> bool,
    {
        let in_progress = self.dir(IssueStatus::InProgress);
        let ready = self.dir(IssueStatus::Ready);
        let mut recovered = Vec::new();
        for name in self.names(IssueStatus::InProgress)? {
            if !predicate(&in_progress.join(&name)) {
                continue;
            }
            let dest_name = unique_name(&ready, "recovered", now, &name);
            match self.move_issue(
                &name,
                IssueStatus::InProgress,
                IssueStatus::Ready,
                &dest_name,
                |c| c.to_string(),
            )? {
                MoveOutcome::Moved { name: to, .. } => {
                    info!(from = %name, to = %to, "recovered in-progress issue");
                    recovered.push(Recovered { from: name, to });
                }
                MoveOutcome::Vanished => {
                    debug!(name, "in-progress issue moved by another worker during recovery");
                }
            }
        }
        Ok(recovered)
    }
}

/// `<prefix>-<ts>-<name>`, with a numeric suffix until nothing collides.
pub fn unique_name(dir: &Path, prefix: &str, now: DateTime<Utc>, name: &str) -> String {
    let ts = now.format("%Y%m%d%H%M%S");
    let base = format!("{prefix}-{ts}-{name}");
    if !dir.join(&base).exists() {
        return base;
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{prefix}-{ts}-{n}-{name}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => Some(mtime),
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), err = %err, "cannot read modification time");
            }
            None
        }
    }
}

/// Atomically replace `path` (hidden temp file + rename in the same directory).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
