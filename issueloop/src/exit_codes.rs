//! Stable exit codes for `issueloop` commands.

/// Command succeeded, including a loop stopped by Ctrl+C.
pub const OK: i32 = 0;
/// Invalid profile or any other error.
pub const INVALID: i32 = 1;
/// Startup preflight failed: missing command or unwritable directory.
pub const PREFLIGHT: i32 = 3;
