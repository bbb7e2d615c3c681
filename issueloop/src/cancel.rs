//! Cooperative cancellation shared by the loop, subprocesses, and sleeps.
//!
//! The loop is synchronous, so cancellation is a shared flag that blocking
//! operations poll in short slices. `Ctrl+C` flips the flag via `ctrlc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

/// Granularity of cancelable waits.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless canceled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_canceled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    /// Install a process-wide `Ctrl+C` handler that cancels this token.
    pub fn install_ctrlc(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down after current step");
            token.cancel();
        })
        .context("install ctrl-c handler")
    }
}
