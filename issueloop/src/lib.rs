//! Autonomous issue-queue runner.
//!
//! Issues are files moving between `ready/`, `in-progress/`, `done/`, and
//! `blocked/`; the loop picks one at a time, runs `codex exec` on it, and
//! decides the outcome through a completion gate. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, classification,
//!   backoff, circuit breaker, gate, busy-wait policy). No I/O.
//! - **[`io`]**: Side-effecting operations (queue directories, subprocesses,
//!   state files). Behind traits where tests need to substitute them.
//!
//! Orchestration modules ([`step`], [`looping`], [`self_heal`], [`watchdog`])
//! coordinate the two.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod issue;
pub mod logging;
pub mod looping;
pub mod self_heal;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watchdog;
