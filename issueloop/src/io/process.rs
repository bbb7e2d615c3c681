//! Helpers for running child processes under a deadline and a cancel token.
//!
//! Output is drained concurrently while the child runs. Both streams are
//! tee'd line by line into an optional log file and into a fixed-size tail
//! buffer used only for failure classification.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// Default size of the classification tail.
pub const DEFAULT_TAIL_BYTES: usize = 64 * 1024;

const WAIT_SLICE: Duration = Duration::from_millis(200);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Bounded ring buffer keeping the most recent bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(DEFAULT_TAIL_BYTES)),
            capacity,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn to_string_lossy(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// How the child finished.
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` when the child was killed (timeout or cancellation).
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub canceled: bool,
    /// Last bytes of interleaved stdout/stderr.
    pub tail: String,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }
}

/// Options for `run_command`.
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub tail_bytes: usize,
    /// Append stdout/stderr here as it arrives.
    pub log_path: Option<&'a Path>,
}

type SharedLog = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command until it exits, times out, or `cancel` fires.
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs(), logging = options.log_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    options: &RunOptions<'_>,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if options.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let log: SharedLog = Arc::new(match options.log_path {
        Some(path) => Some(Mutex::new(BufWriter::new(open_append(path)?))),
        None => None,
    });
    let tail = Arc::new(Mutex::new(TailBuffer::new(options.tail_bytes)));

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = {
        let (log, tail) = (log.clone(), tail.clone());
        thread::spawn(move || tee_stream(stdout, log, tail))
    };
    let stderr_handle = {
        let (log, tail) = (log.clone(), tail.clone());
        thread::spawn(move || tee_stream(stderr, log, tail))
    };

    let stdin_handle = match options.stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                // A child that exits without reading stdin closes the pipe early.
                if let Err(err) = child_stdin.write_all(&input) {
                    warn!(err = %err, "child closed stdin early");
                }
                Ok::<(), anyhow::Error>(())
            }))
        }
        None => None,
    };

    let deadline = Instant::now() + options.timeout;
    let mut timed_out = false;
    let mut canceled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(WAIT_SLICE).context("wait for command")? {
            break Some(status);
        }
        if cancel.is_canceled() {
            warn!("cancellation requested, killing child");
            canceled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = options.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        child.kill().context("kill command")?;
        child.wait().context("wait command after kill")?;
        break None;
    };

    let killed = status.is_none();
    if let Some(handle) = stdin_handle {
        join_reader(handle, killed).context("join stdin")?;
    }
    join_reader(stdout_handle, killed).context("join stdout")?;
    join_reader(stderr_handle, killed).context("join stderr")?;

    if let Some(lock) = &*log
        && let Ok(mut writer) = lock.lock()
        && let Err(err) = writer.flush()
    {
        warn!(err = %err, "failed to flush command log");
    }

    let tail = tail
        .lock()
        .map(|t| t.to_string_lossy())
        .map_err(|_| anyhow!("tail buffer poisoned"))?;

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, canceled, "command finished");
    Ok(CommandOutput {
        status,
        timed_out,
        canceled,
        tail,
    })
}

/// Run `sh -c <script>` in `workdir`.
pub fn shell(script: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(workdir);
    cmd
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))
}

fn tee_stream<R: Read>(reader: R, log: SharedLog, tail: Arc<Mutex<TailBuffer>>) -> Result<()> {
    let mut buf_reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *log
            && let Ok(mut writer) = mutex.lock()
            && let Err(e) = writer.write_all(&line)
        {
            warn!(err = %e, "failed to write command log");
        }

        if let Ok(mut tail) = tail.lock() {
            tail.push(&line);
        }
    }
    Ok(())
}

/// Join a pipe thread. After a kill, grandchildren may still hold the pipe
/// open; give up after `KILL_GRACE` and leave the thread detached.
fn join_reader(handle: thread::JoinHandle<Result<()>>, killed: bool) -> Result<()> {
    if killed {
        let started = Instant::now();
        while !handle.is_finished() {
            if started.elapsed() >= KILL_GRACE {
                warn!("pipe still open after kill, detaching reader");
                return Ok(());
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(timeout: Duration) -> RunOptions<'static> {
        RunOptions {
            stdin: None,
            timeout,
            tail_bytes: DEFAULT_TAIL_BYTES,
            log_path: None,
        }
    }

    #[test]
    fn tail_buffer_keeps_most_recent_bytes() {
        let mut tail = TailBuffer::new(5);
        tail.push(b"abc");
        tail.push(b"defg");
        assert_eq!(tail.to_string_lossy(), "cdefg");
        tail.push(b"0123456789");
        assert_eq!(tail.to_string_lossy(), "56789");
        assert_eq!(tail.len(), 5);
    }

    #[test]
    fn zero_capacity_tail_stays_empty() {
        let mut tail = TailBuffer::new(0);
        tail.push(b"abc");
        assert!(tail.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams_into_tail_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("run.log");
        let options = RunOptions {
            log_path: Some(&log),
            ..opts(Duration::from_secs(10))
        };
        let out = run_command(
            shell("echo out; echo err >&2; exit 3", temp.path()),
            &options,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.exit_code(), Some(3));
        assert!(out.tail.contains("out"));
        assert!(out.tail.contains("err"));
        let logged = std::fs::read_to_string(&log).expect("read log");
        assert!(logged.contains("out") && logged.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn passes_stdin_to_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let options = RunOptions {
            stdin: Some(b"hello from stdin\n"),
            ..opts(Duration::from_secs(10))
        };
        let out = run_command(shell("cat", temp.path()), &options, &CancelToken::new())
            .expect("run");
        assert!(out.success());
        assert!(out.tail.contains("hello from stdin"));
    }

    #[cfg(unix)]
    #[test]
    fn kills_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_command(
            shell("exec sleep 30", temp.path()),
            &opts(Duration::from_millis(300)),
            &CancelToken::new(),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(out.status.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn kills_on_cancel() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = run_command(
            shell("exec sleep 30", temp.path()),
            &opts(Duration::from_secs(60)),
            &cancel,
        )
        .expect("run");
        assert!(out.canceled);
        assert!(!out.timed_out);
    }
}
