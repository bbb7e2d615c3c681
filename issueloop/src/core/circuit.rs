//! Circuit breaker over agent invocations.
//!
//! Closed/open is derived from `open_until`: the circuit is open exactly
//! while `now < open_until`. Persisted as flat `key=value` lines.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};

pub const DEFAULT_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub open_until: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Transition caused by recording an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Opened,
}

impl CircuitBreakerState {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        matches!(self.open_until, Some(until) if now < until)
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.open_until = None;
        self.last_success_at = Some(now);
    }

    /// Count a retryable failure; opens the circuit at `threshold`.
    pub fn record_retryable_failure(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
        threshold: u32,
        cooldown: chrono::Duration,
    ) -> Transition {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(reason.to_string());
        if self.consecutive_failures >= threshold.max(1) {
            let until = now.checked_add_signed(cooldown);
            self.open_until = Some(until.unwrap_or(DateTime::<Utc>::MAX_UTC));
            self.last_opened_at = Some(now);
            return Transition::Opened;
        }
        Transition::Unchanged
    }

    /// Non-retryable failures are a different class of problem: reset the streak.
    pub fn record_terminal_failure(&mut self, reason: &str) {
        self.consecutive_failures = 0;
        self.last_failure = Some(reason.to_string());
    }

    pub fn to_kv(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "consecutive_failures={}\n",
            self.consecutive_failures
        ));
        out.push_str(&format!("open_until={}\n", fmt_time(self.open_until)));
        out.push_str(&format!(
            "last_failure={}\n",
            self.last_failure.as_deref().unwrap_or("")
        ));
        out.push_str(&format!(
            "last_opened_at={}\n",
            fmt_time(self.last_opened_at)
        ));
        out.push_str(&format!(
            "last_success_at={}\n",
            fmt_time(self.last_success_at)
        ));
        out
    }

    pub fn from_kv(contents: &str) -> Result<Self> {
        let mut state = Self::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed circuit state line '{line}'"))?;
            let value = value.trim();
            match key.trim() {
                "consecutive_failures" => {
                    state.consecutive_failures = value
                        .parse()
                        .with_context(|| format!("parse consecutive_failures '{value}'"))?;
                }
                "open_until" => state.open_until = parse_time(value)?,
                "last_failure" => {
                    state.last_failure = (!value.is_empty()).then(|| value.to_string());
                }
                "last_opened_at" => state.last_opened_at = parse_time(value)?,
                "last_success_at" => state.last_success_at = parse_time(value)?,
                _ => {}
            }
        }
        Ok(state)
    }
}

fn fmt_time(value: Option<DateTime<Utc>>) -> String {
    value.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn parse_time(value: &str) -> Result<Option<DateTime<Utc>>> {
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parse timestamp '{value}'"))?;
    Ok(Some(parsed.with_timezone(&Utc)))
}
