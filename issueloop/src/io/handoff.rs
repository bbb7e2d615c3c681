//! Handoff artifact checks.
//!
//! A role may be required to leave a JSON artifact at
//! `handoff/<issue_id>.<role>.json` before its issue can complete. This
//! module only inspects the file; the agent produces it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, warn};

pub fn handoff_path(handoff_dir: &Path, issue_id: &str, role: Option<&str>) -> PathBuf {
    let role = role.unwrap_or("any");
    handoff_dir.join(format!("{issue_id}.{role}.json"))
}

/// Why a handoff artifact does not count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffStatus {
    Present,
    Missing,
    Invalid(String),
}

impl HandoffStatus {
    pub fn is_present(&self) -> bool {
        matches!(self, HandoffStatus::Present)
    }
}

/// What a role's handoff must satisfy.
#[derive(Debug, Clone, Default)]
pub struct HandoffRequirements<'a> {
    pub required_fields: &'a [String],
    /// JSON Schema file for the role.
    pub schema_path: Option<&'a Path>,
}

/// Check the artifact exists, is a JSON object, carries the required fields,
/// and validates against the role schema when one is configured.
pub fn check_handoff(path: &Path, requirements: &HandoffRequirements<'_>) -> Result<HandoffStatus> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "handoff artifact missing");
            return Ok(HandoffStatus::Missing);
        }
        Err(err) => return Err(err).with_context(|| format!("read handoff {}", path.display())),
    };

    let value: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "handoff artifact is not valid JSON");
            return Ok(HandoffStatus::Invalid(format!("invalid json: {err}")));
        }
    };
    let Some(object) = value.as_object() else {
        return Ok(HandoffStatus::Invalid("not a json object".to_string()));
    };
    let missing: Vec<&str> = requirements
        .required_fields
        .iter()
        .filter(|field| !object.contains_key(field.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        warn!(path = %path.display(), missing = ?missing, "handoff artifact missing fields");
        return Ok(HandoffStatus::Invalid(format!(
            "missing fields: {}",
            missing.join(", ")
        )));
    }
    if let Some(schema_path) = requirements.schema_path {
        let messages = schema_errors(schema_path, &value)?;
        if !messages.is_empty() {
            warn!(path = %path.display(), errors = messages.len(), "handoff artifact fails schema");
            return Ok(HandoffStatus::Invalid(format!(
                "schema validation failed: {}",
                messages.join("; ")
            )));
        }
    }
    Ok(HandoffStatus::Present)
}

/// Validate `instance` against a JSON Schema (Draft 2020-12) file.
fn schema_errors(schema_path: &Path, instance: &Value) -> Result<Vec<String>> {
    let raw = fs::read_to_string(schema_path)
        .with_context(|| format!("read handoff schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse handoff schema {}", schema_path.display()))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .with_context(|| format!("compile handoff schema {}", schema_path.display()))?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}
