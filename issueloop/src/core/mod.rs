//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests; time is always
//! passed in by the caller.

pub mod backoff;
pub mod busy_wait;
pub mod circuit;
pub mod classifier;
pub mod gate;
pub mod selector;
pub mod types;
