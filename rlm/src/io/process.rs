//! Bounded-time child processes for skills that shell out.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// A command to run with a hard wall-clock bound.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

/// Captured output of a finished (or killed) child.
#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` when the child was killed after the timeout.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub dropped_bytes: usize,
}

impl ProcessOutput {
    pub fn timed_out(&self) -> bool {
        self.status.is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Extra time granted to the pipe readers once the child has been reaped.
const READER_GRACE: Duration = Duration::from_millis(200);

/// Bytes read from one pipe so far.
#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Captured> {
    match capture.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Spawn the command, drain both pipes on reader threads, and kill it past the timeout.
///
/// The call returns by `timeout` plus a short grace even when a grandchild
/// keeps the pipes open; such readers are abandoned with what they captured.
#[instrument(
    skip_all,
    fields(program = %request.program, timeout_secs = request.timeout.as_secs())
)]
pub fn run_bounded(request: &ProcessRequest) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let deadline = Instant::now() + request.timeout;
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", request.program))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = request.output_limit_bytes;
    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, limit, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, limit, done_tx);

    let status = match child.wait_timeout(request.timeout).context("wait for child")? {
        Some(status) => Some(status),
        None => {
            warn!(timeout_secs = request.timeout.as_secs(), "child timed out, killing");
            child.kill().context("kill child")?;
            child.wait().context("reap child after kill")?;
            None
        }
    };

    for _ in 0..2 {
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .max(READER_GRACE);
        match done_rx.recv_timeout(wait) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.context("read child output")),
            Err(_) => {
                warn!("child output still open past the deadline, abandoning readers");
                break;
            }
        }
    }

    let (stdout, stdout_dropped) = take_capture(&stdout_capture);
    let (stderr, stderr_dropped) = take_capture(&stderr_capture);

    debug!(exit_code = ?status.and_then(|s| s.code()), "child finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        dropped_bytes: stdout_dropped + stderr_dropped,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<Result<()>>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let sink = Arc::clone(&capture);
    thread::spawn(move || {
        let outcome = read_limited(reader, limit, &sink);
        // The receiver is gone once the caller has given up on this reader.
        let _ = done.send(outcome);
    });
    capture
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize) {
    let mut guard = lock(capture);
    (std::mem::take(&mut guard.kept), guard.dropped)
}

fn read_limited<R: Read>(mut reader: R, limit: usize, capture: &SharedCapture) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        let mut guard = lock(capture);
        let room = limit.saturating_sub(guard.kept.len()).min(n);
        guard.kept.extend_from_slice(&chunk[..room]);
        guard.dropped += n - room;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(program: &str, args: &[&str], timeout: Duration) -> ProcessRequest {
        ProcessRequest {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            workdir: std::env::temp_dir(),
            timeout,
            output_limit_bytes: 16,
        }
    }

    #[test]
    fn captures_output_and_exit_code() {
        let out = run_bounded(&request("sh", &["-c", "echo hi; exit 3"], Duration::from_secs(5)))
            .expect("run");
        assert_eq!(out.exit_code(), Some(3));
        assert_eq!(out.stdout_text(), "hi");
        assert!(!out.timed_out());
    }

    #[test]
    fn kills_child_past_timeout() {
        let out = run_bounded(&request("sleep", &["5"], Duration::from_millis(100))).expect("run");
        assert!(out.timed_out());
        assert_eq!(out.exit_code(), None);
    }

    #[test]
    fn timeout_holds_when_a_grandchild_keeps_the_pipes_open() {
        let started = Instant::now();
        let out = run_bounded(&request(
            "sh",
            &["-c", "sleep 4; echo done"],
            Duration::from_millis(200),
        ))
        .expect("run");
        assert!(out.timed_out());
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "returned after {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn keeps_output_written_before_the_timeout() {
        let out = run_bounded(&request(
            "sh",
            &["-c", "echo early; sleep 4"],
            Duration::from_millis(500),
        ))
        .expect("run");
        assert!(out.timed_out());
        assert_eq!(out.stdout_text(), "early");
    }

    #[test]
    fn drops_output_beyond_limit() {
        let out = run_bounded(&request(
            "sh",
            &["-c", "printf '0123456789abcdefXYZ'"],
            Duration::from_secs(5),
        ))
        .expect("run");
        assert_eq!(out.stdout, b"0123456789abcdef");
        assert_eq!(out.dropped_bytes, 3);
    }
}
