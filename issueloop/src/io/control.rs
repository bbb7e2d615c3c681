//! External enabled flag polled once per iteration.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub trait EnabledFlag {
    fn is_enabled(&self) -> Result<bool>;
}

/// `.issueloop/enabled`: absent means enabled.
#[derive(Debug, Clone)]
pub struct FileEnabledFlag {
    pub path: PathBuf,
}

impl EnabledFlag for FileEnabledFlag {
    fn is_enabled(&self) -> Result<bool> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(parse_enabled(&contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err).with_context(|| format!("read {}", self.path.display())),
        }
    }
}

/// Always-on flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl EnabledFlag for AlwaysEnabled {
    fn is_enabled(&self) -> Result<bool> {
        Ok(true)
    }
}

pub fn parse_enabled(contents: &str) -> bool {
    !matches!(
        contents.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "disabled" | "no"
    )
}
