/// Process Runner - One Child Process per Call
///
/// **Core Responsibility:**
/// Spawn a program, feed it stdin, capture stdout/stderr, and enforce a hard
/// wall-clock deadline.
///
/// **Guarantees:**
/// - The child runs in its own process group; on timeout, cancellation, or
///   normal exit the whole group is SIGKILLed, so shells that fork cannot
///   leave descendants behind
/// - stdin is closed after the input is written (programs see EOF)
/// - stdout and stderr are each capped; excess output is drained and dropped
/// - The call never blocks longer than `timeout` plus the kill grace period
///
/// The runner knows nothing about test cases or verdicts.

use crate::metrics;
use crate::toolchain::CommandLine;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;

/// Everything needed for one invocation.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub command: &'a CommandLine,
    pub cwd: &'a Path,
    pub stdin: &'a [u8],
    pub timeout: Duration,
    /// RLIMIT_AS for the child, when memory limits are enforced
    pub memory_limit_bytes: Option<u64>,
}

/// Raw result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub output_limit_exceeded: bool,
}

impl RunOutcome {
    /// Exited on its own with status 0.
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output_bytes: usize,
    kill_grace: Duration,
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(max_output_bytes: usize, kill_grace: Duration) -> Self {
        Self {
            max_output_bytes,
            kill_grace,
        }
    }

    /// Run one process to completion, timeout, or cancellation.
    ///
    /// Errors are reserved for infrastructure failures (the program could
    /// not be spawned or waited on). Anything the program itself does is
    /// reported in the returned `RunOutcome`.
    pub async fn run(
        &self,
        request: RunRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let command = request.command;
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(request.cwd)
            .env_remove("JAVA_TOOL_OPTIONS")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(bytes) = request.memory_limit_bytes {
                // SAFETY: setrlimit is async-signal-safe and touches no
                // state shared with the parent.
                unsafe {
                    cmd.pre_exec(move || set_address_space_limit(bytes));
                }
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", command.program))?;
        let started = Instant::now();
        let mut group = ProcessGroupGuard::new(child.id());

        let stdin_task = child.stdin.take().map(|mut pipe| {
            let data = request.stdin.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&data).await {
                    if e.kind() != ErrorKind::BrokenPipe {
                        debug!(error = %e, "Failed to write stdin");
                    }
                }
                // Dropping the pipe closes it
            })
        });
        let drain = CancellationToken::new();
        let stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(read_capped(pipe, self.max_output_bytes, drain.clone()))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(read_capped(pipe, self.max_output_bytes, drain.clone()))
        });

        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Stop::TimedOut,
            _ = cancel.cancelled() => Stop::Cancelled,
        };
        let wall_time_ms = started.elapsed().as_millis() as u64;

        let mut outcome = RunOutcome {
            wall_time_ms,
            ..Default::default()
        };

        match stop {
            Stop::Exited(status) => {
                let status = status.context("Failed to wait for child process")?;
                outcome.exit_code = status.code();
                outcome.signal = exit_signal(&status);
                if group.kill() {
                    debug!(program = %command.program, "Killed leftover descendants");
                }
            }
            Stop::TimedOut => {
                outcome.timed_out = true;
                terminate(&mut child, &mut group, "timeout").await;
            }
            Stop::Cancelled => {
                outcome.cancelled = true;
                terminate(&mut child, &mut group, "cancelled").await;
            }
        }
        if outcome.timed_out || outcome.cancelled {
            debug!(
                program = %command.program,
                wall_time_ms,
                timed_out = outcome.timed_out,
                "Process group killed"
            );
        }

        if let Some(task) = stdin_task {
            task.abort();
        }

        // Both streams share one grace period
        let ((stdout, stdout_over), (stderr, stderr_over)) = tokio::join!(
            self.collect(stdout_task, &drain),
            self.collect(stderr_task, &drain)
        );
        outcome.stdout = String::from_utf8_lossy(&stdout).into_owned();
        outcome.stderr = String::from_utf8_lossy(&stderr).into_owned();
        outcome.output_limit_exceeded = stdout_over || stderr_over;

        Ok(outcome)
    }

    /// Waits up to the kill grace for a reader to hit EOF, then stops it and
    /// keeps whatever it already read.
    async fn collect(
        &self,
        task: Option<JoinHandle<(Vec<u8>, bool)>>,
        drain: &CancellationToken,
    ) -> (Vec<u8>, bool) {
        let Some(mut task) = task else {
            return (Vec::new(), false);
        };
        let joined = match tokio::time::timeout(self.kill_grace, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                // Something outside the process group still holds the pipe
                warn!("Output pipe still open after kill grace period");
                drain.cancel();
                task.await
            }
        };
        joined.unwrap_or_else(|e| {
            warn!(error = %e, "Output reader task failed");
            (Vec::new(), false)
        })
    }
}

async fn terminate(child: &mut Child, group: &mut ProcessGroupGuard, reason: &str) {
    group.kill();
    metrics::KILLED_PROCESS_GROUPS
        .with_label_values(&[reason])
        .inc();
    // Reap the leader so no zombie is left behind
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already gone");
    }
}

/// Read from `reader` until EOF or `stop`, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    stop: CancellationToken,
) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut exceeded = false;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = stop.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    exceeded = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Output read failed");
                break;
            }
        }
    }
    (kept, exceeded)
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn set_address_space_limit(bytes: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// SIGKILLs the child's process group when asked, and again on drop.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    /// Returns true if any member of the group was still alive.
    ///
    /// Disarms the guard: once the group is gone its id may be reused.
    #[cfg(unix)]
    fn kill(&mut self) -> bool {
        let Some(pgid) = self.pgid.take() else {
            return false;
        };
        // SAFETY: plain syscall; the group id came from our own child.
        unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) == 0 }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> bool {
        false
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}
