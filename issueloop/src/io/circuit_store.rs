//! Circuit breaker persistence (`state/circuit_breaker.state`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::circuit::CircuitBreakerState;
use crate::io::store::write_atomic;

/// Load the breaker state; a missing file is a closed breaker.
pub fn load_circuit(path: &Path) -> Result<CircuitBreakerState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CircuitBreakerState::default()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let state = CircuitBreakerState::from_kv(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    debug!(consecutive_failures = state.consecutive_failures, open_until = ?state.open_until, "circuit state loaded");
    Ok(state)
}

pub fn save_circuit(path: &Path, state: &CircuitBreakerState) -> Result<()> {
    debug!(path = %path.display(), consecutive_failures = state.consecutive_failures, "writing circuit state");
    write_atomic(path, &state.to_kv())
}
