//! I/O adapters: filesystem queue, state files, subprocesses.

pub mod busy_wait_store;
pub mod circuit_store;
pub mod config;
pub mod control;
pub mod executor;
pub mod handoff;
pub mod journal;
pub mod paths;
pub mod preflight;
pub mod process;
pub mod prompt;
pub mod store;
pub mod validation;
