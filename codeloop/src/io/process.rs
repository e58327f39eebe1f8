//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Upper bound on a single `wait_timeout` slice between cancellation checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for pipe readers once the child has exited.
const READER_GRACE: Duration = Duration::from_secs(2);

/// The caller cancelled the operation while a child process was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    /// Lossy stdout text followed by a truncation notice when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        with_notice(&self.stdout, "stdout", self.stdout_truncated)
    }

    /// Lossy stderr text followed by a truncation notice when bytes were dropped.
    pub fn stderr_text(&self) -> String {
        with_notice(&self.stderr, "stderr", self.stderr_truncated)
    }
}

fn with_notice(bytes: &[u8], label: &str, truncated: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group and the whole group is killed on timeout,
/// cancellation, or once the child exits. Cancellation returns a [`Cancelled`] error.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
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
    let stdout_capture = spawn_reader(stdout, output_limit_bytes);
    let stderr_capture = spawn_reader(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // Written off-thread so a child that never reads cannot stall the timeout loop.
        let input = input.to_vec();
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                // The child may exit before consuming its input; its status tells the real story.
                debug!(err = %e, "failed to write child stdin");
            }
        });
    }

    let deadline = started + timeout;
    let mut timed_out = false;
    let status = loop {
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            kill_child(&mut child)?;
            return Err(Cancelled.into());
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            break kill_child(&mut child)?;
        }
        let slice = (deadline - now).min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            kill_process_group(&child);
            break status;
        }
    };
    let duration = started.elapsed();

    let (stdout, stdout_truncated) = stdout_capture.finish("stdout")?;
    let (stderr, stderr_truncated) = stderr_capture.finish("stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, duration_ms = duration.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        duration,
    })
}

fn kill_child(child: &mut Child) -> Result<ExitStatus> {
    kill_process_group(child);
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill after group kill failed");
    }
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// Kill every process left in the child's group, including background grandchildren.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        warn!(pid = child.id(), "child pid out of range for a process group");
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => {}
        // The group is already gone.
        Err(Errno::ESRCH) => debug!(pgid, "process group already exited"),
        Err(e) => warn!(pgid, err = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
    error: Option<String>,
}

struct StreamCapture {
    shared: Arc<Mutex<Captured>>,
    handle: thread::JoinHandle<()>,
}

impl StreamCapture {
    /// Wait briefly for the reader, then take whatever has been captured.
    fn finish(self, label: &str) -> Result<(Vec<u8>, usize)> {
        let grace_deadline = Instant::now() + READER_GRACE;
        while !self.handle.is_finished() && Instant::now() < grace_deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.handle.is_finished() {
            if self.handle.join().is_err() {
                return Err(anyhow!("{label} reader thread panicked"));
            }
        } else {
            warn!(stream = label, "pipe still open after exit, keeping partial output");
        }

        let mut captured = self
            .shared
            .lock()
            .map_err(|_| anyhow!("{label} capture lock poisoned"))?;
        if let Some(err) = captured.error.take() {
            warn!(stream = label, err = %err, "error while reading output");
        }
        Ok((std::mem::take(&mut captured.bytes), captured.truncated))
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> StreamCapture {
    let shared = Arc::new(Mutex::new(Captured::default()));
    let sink = Arc::clone(&shared);
    let handle = thread::spawn(move || read_stream_limited(reader, limit, &sink));
    StreamCapture { shared, handle }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if let Ok(mut captured) = sink.lock() {
                    captured.error = Some(e.to_string());
                }
                break;
            }
        };
        let Ok(mut captured) = sink.lock() else {
            break;
        };
        let remaining = limit.saturating_sub(captured.bytes.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.truncated += n.saturating_sub(keep);
        } else {
            captured.truncated += n;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_streams_and_exit_code() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
            &CancellationToken::new(),
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let output = run_command_with_timeout(
            sh("cat"),
            Some(b"hello prompt"),
            Duration::from_secs(10),
            1024,
            &CancellationToken::new(),
        )
        .expect("run");
        assert_eq!(output.stdout, b"hello prompt");
    }

    #[test]
    fn timeout_kills_background_children_too() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30 & sleep 30"),
            None,
            Duration::from_millis(300),
            1024,
            &CancellationToken::new(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timed_out_grandchild_never_runs_to_completion() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("alive");
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(format!(
                "(/bin/sleep 1; echo alive > '{}') & /bin/sleep 30",
                marker.display()
            ))
            .env("PATH", "/nonexistent");
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_millis(200),
            1024,
            &CancellationToken::new(),
        )
        .expect("run");
        assert!(output.timed_out);

        thread::sleep(Duration::from_secs(2));
        assert!(!marker.exists(), "grandchild outlived the timeout");
    }

    #[test]
    fn truncates_and_marks_output() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
            &CancellationToken::new(),
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_text().ends_with("[stdout truncated 6 bytes]\n"));
    }

    #[test]
    fn cancellation_kills_and_reports_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run_command_with_timeout(sh("sleep 30"), None, Duration::from_secs(30), 1024, &cancel)
            .expect_err("cancelled");
        canceller.join().expect("join");
        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn already_cancelled_token_skips_spawn() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_command_with_timeout(sh("exit 0"), None, Duration::from_secs(1), 16, &cancel)
            .expect_err("cancelled");
        assert!(err.is::<Cancelled>());
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let err = run_command_with_timeout(
            Command::new("/nonexistent/interpreter"),
            None,
            Duration::from_secs(1),
            16,
            &CancellationToken::new(),
        )
        .expect_err("spawn fails");
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
