//! Blocking child-process runner with a wall-clock timeout and bounded capture.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long output readers may keep running once the child is gone. A
/// descendant that escaped the process group can hold the pipes open
/// indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Default)]
struct Capture {
    kept: Vec<u8>,
    dropped: usize,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Run `cmd` to completion or until `timeout` elapses.
///
/// stdin is closed. stdout and stderr are drained on separate threads while
/// the child runs so a chatty child cannot deadlock on a full pipe; bytes past
/// `output_limit_bytes` are counted and discarded. On unix the child leads its
/// own process group, and a timeout kills the whole group so tool
/// subprocesses die with it. Draining after the child is gone is bounded by
/// [`DRAIN_GRACE`]; past that the group is killed and whatever was captured
/// is returned.
///
/// Spawn failures keep the underlying [`std::io::Error`] in the error chain so
/// callers can tell a missing executable apart from other failures.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            kill_process_group(child.id());
            if let Err(err) = child.kill() {
                debug!(err = %err, "child already gone after group kill");
            }
            (child.wait().context("wait command after kill")?, true)
        }
    };

    // An exited child still gets the rest of its time budget for descendants
    // to finish writing.
    let drain_budget = if timed_out {
        DRAIN_GRACE
    } else {
        timeout
            .saturating_sub(started.elapsed())
            .saturating_add(DRAIN_GRACE)
    };
    if !wait_for_readers(&done_rx, 2, Instant::now().checked_add(drain_budget))? {
        // Descendants left behind still hold the pipes.
        kill_process_group(child.id());
    }

    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Drain `reader` on a detached thread and report on `done` when it hits EOF.
fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<Result<()>>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let sink = Arc::clone(&capture);
    thread::spawn(move || {
        let outcome = drain_limited(reader, limit, &sink);
        // The receiver is gone once the caller stopped waiting.
        let _ = done.send(outcome);
    });
    capture
}

/// Returns false when `deadline` passed before every reader hit EOF. A `None`
/// deadline (budget past what `Instant` can represent) waits for EOF.
fn wait_for_readers(
    done: &mpsc::Receiver<Result<()>>,
    readers: usize,
    deadline: Option<Instant>,
) -> Result<bool> {
    for _ in 0..readers {
        let received = match deadline {
            Some(deadline) => done.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(outcome) => outcome?,
            Err(RecvTimeoutError::Timeout) => {
                warn!("output pipes still held open; returning partial output");
                return Ok(false);
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    Ok(true)
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize) {
    let mut guard = lock(capture);
    (std::mem::take(&mut guard.kept), guard.dropped)
}

fn drain_limited<R: Read>(mut reader: R, limit: usize, capture: &Mutex<Capture>) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut capture = lock(capture);
        let room = limit.saturating_sub(capture.kept.len());
        let keep = n.min(room);
        capture.kept.extend_from_slice(&chunk[..keep]);
        capture.dropped += n - keep;
    }
}

fn lock(capture: &Mutex<Capture>) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, err = %std::io::Error::last_os_error(), "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
