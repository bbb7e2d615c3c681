//! Per-run log paths and the progress journal (`logs/progress.log`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::core::types::Outcome;
use crate::io::paths::QueuePaths;

/// Files produced while processing one issue.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub log_path: PathBuf,
    pub last_message_path: PathBuf,
    pub validation_log_path: PathBuf,
}

impl RunPaths {
    pub fn new(paths: &QueuePaths, issue_id: &str, started_at: DateTime<Utc>) -> Self {
        let stem = format!("{}-{}", sanitize(issue_id), started_at.format("%Y%m%d%H%M%S"));
        Self {
            log_path: paths.runs_dir.join(format!("{stem}.log")),
            last_message_path: paths.runs_dir.join(format!("{stem}.last.txt")),
            validation_log_path: paths.validation_logs_dir.join(format!("{stem}.log")),
        }
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One journal line per terminal outcome.
#[derive(Debug, Clone)]
pub struct JournalEntry<'a> {
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub issue_id: &'a str,
    pub file_name: &'a str,
    pub role: Option<&'a str>,
    pub reason: Option<&'a str>,
}

impl JournalEntry<'_> {
    pub fn render(&self) -> String {
        format!(
            "{} {} issue={} file={} role={} reason={}\n",
            self.timestamp.to_rfc3339(),
            self.outcome,
            self.issue_id,
            self.file_name,
            self.role.unwrap_or("-"),
            self.reason.unwrap_or("none"),
        )
    }
}

pub fn append_journal(path: &Path, entry: &JournalEntry<'_>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open journal {}", path.display()))?;
    file.write_all(entry.render().as_bytes())
        .with_context(|| format!("append journal {}", path.display()))
}
