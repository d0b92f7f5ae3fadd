//! Command runner for external tools (vmrun, tcpdump helpers).
//!
//! Every call creates exactly one child process and reaps it before
//! returning. A non-zero exit status or stderr content is data, not an error:
//! the caller inspects [`CommandOutput`]. [`LaunchError`] is reserved for
//! "the tool never ran to completion": missing binary, spawn failure, or
//! timeout.
//!
//! - Per-command timeout with SIGTERM → SIGKILL escalation
//! - Output size caps to prevent memory exhaustion
//! - Minimal, locale-neutral environment so tool output stays parseable
//! - Command path validation to prevent injection

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

/// Default maximum output size per stream in bytes (1MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL on timeout.
const SIGTERM_GRACE_MS: u64 = 500;

/// Errors raised when a tool could not be run to completion.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("invalid command path: {0}")]
    InvalidPath(String),

    #[error("failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output from a completed tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output (may be truncated).
    pub stdout: Vec<u8>,

    /// Standard error (may be truncated).
    pub stderr: Vec<u8>,

    /// Exit code (None if killed by a signal).
    pub exit_code: Option<i32>,

    /// Whether output was truncated.
    pub truncated: bool,

    /// Execution duration.
    pub duration: Duration,
}

impl CommandOutput {
    /// Build an output record directly (used by fakes and tests).
    pub fn new(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            truncated: false,
            duration: Duration::ZERO,
        }
    }

    /// Get stdout as string (lossy UTF-8 conversion).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as string (lossy UTF-8 conversion).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One-line description of a failed run for error messages.
    pub fn failure_summary(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        let detail = first_non_empty_line(&self.stderr_str())
            .or_else(|| first_non_empty_line(&self.stdout_str()));
        match detail {
            Some(line) => format!("{status}: {line}"),
            None => status,
        }
    }
}

fn first_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Short name of an invocation for diagnostics, e.g. `vmrun revertToSnapshot`.
pub fn invocation_name(program: &Path, args: &[String]) -> String {
    let base = program
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<tool>");
    match args.first() {
        Some(sub) => format!("{base} {sub}"),
        None => base.to_string(),
    }
}

/// Anything that can run a tool and report its outcome.
///
/// The machine controller only talks to tools through this trait so tests
/// can substitute a scripted runner.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, LaunchError>;
}

/// Configuration for the process runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum output size per stream in bytes.
    pub max_output_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Runs tools as real child processes.
#[derive(Debug, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Validate that a command is safe to execute.
    fn validate_command(&self, program: &Path) -> Result<(), LaunchError> {
        let cmd = program.to_string_lossy();

        if cmd.is_empty() {
            return Err(LaunchError::InvalidPath("empty command".to_string()));
        }

        // Reject commands with shell metacharacters
        if cmd.contains(['|', '&', ';', '$', '`', '\n', '\r']) {
            return Err(LaunchError::InvalidPath(format!(
                "command contains shell metacharacters: {}",
                cmd
            )));
        }

        // Verify command exists if it's a path rather than a bare name
        if program.components().count() > 1 && !program.exists() {
            return Err(LaunchError::NotFound(cmd.to_string()));
        }

        Ok(())
    }

    fn build_command(&self, program: &Path, args: &[String]) -> Command {
        let mut command = Command::new(program);
        command.args(args);

        // Clear environment variables that could affect output parsing
        command.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            // vmrun reads per-user preferences from $HOME
            command.env("HOME", home);
        }
        command.env("LC_ALL", "C");
        command.env("LANG", "C");

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// Execute a child process with timeout and output capture.
    #[allow(clippy::type_complexity)]
    fn execute_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<(Vec<u8>, Vec<u8>, Option<i32>, bool, bool), LaunchError> {
        let max_output = self.config.max_output_bytes;
        let deadline = Instant::now() + timeout;
        let mut stdout_buf = Vec::with_capacity(max_output.min(65536));
        let mut stderr_buf = Vec::with_capacity(max_output.min(65536));
        let mut truncated = false;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let mut chunk = vec![0u8; 8192];

        loop {
            if Instant::now() >= deadline {
                warn!(pid = child.id(), "command timed out, sending SIGTERM");
                kill_with_grace(child);
                let status = child.wait().ok();
                return Ok((
                    stdout_buf,
                    stderr_buf,
                    status.and_then(|s| s.code()),
                    truncated,
                    true,
                ));
            }

            let mut did_read = false;

            if let Some(ref mut out) = stdout {
                if let Ok(n) = try_read_nonblocking(out, &mut chunk) {
                    if n > 0 {
                        did_read = true;
                        append_capped(&mut stdout_buf, &chunk[..n], max_output, &mut truncated);
                    }
                }
            }

            if let Some(ref mut err) = stderr {
                if let Ok(n) = try_read_nonblocking(err, &mut chunk) {
                    if n > 0 {
                        did_read = true;
                        append_capped(&mut stderr_buf, &chunk[..n], max_output, &mut truncated);
                    }
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    // Process exited, drain remaining output
                    if let Some(ref mut out) = stdout {
                        let _ = drain_to_limit(out, &mut stdout_buf, max_output, &mut truncated);
                    }
                    if let Some(ref mut err) = stderr {
                        let _ = drain_to_limit(err, &mut stderr_buf, max_output, &mut truncated);
                    }

                    let exit_code = status.code();
                    trace!(exit_code = ?exit_code, "process exited");
                    return Ok((stdout_buf, stderr_buf, exit_code, truncated, false));
                }
                Ok(None) => {
                    if !did_read {
                        // Avoid busy-waiting
                        thread::sleep(Duration::from_millis(10));
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to wait for child");
                    kill_with_grace(child);
                    let _ = child.wait();
                    return Err(LaunchError::Io(e));
                }
            }
        }
    }
}

impl CommandRunner for ProcessRunner {
    #[instrument(skip(self, args), fields(cmd = %invocation_name(program, args)))]
    fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, LaunchError> {
        self.validate_command(program)?;

        debug!(
            command = %program.display(),
            args = ?args,
            timeout_ms = timeout.as_millis() as u64,
            "running tool"
        );

        let start = Instant::now();
        let mut child = match self.build_command(program, args).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(command = %program.display(), error = %e, "failed to spawn");
                return Err(LaunchError::SpawnFailed {
                    program: program.display().to_string(),
                    message: e.to_string(),
                });
            }
        };

        let (stdout, stderr, exit_code, truncated, timed_out) =
            self.execute_with_timeout(&mut child, timeout)?;
        let duration = start.elapsed();

        if timed_out {
            return Err(LaunchError::TimedOut {
                program: program.display().to_string(),
                timeout,
            });
        }

        debug!(
            command = %program.display(),
            duration_ms = duration.as_millis() as u64,
            exit_code = ?exit_code,
            "tool execution complete"
        );

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            truncated,
            duration,
        })
    }
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8], max: usize, truncated: &mut bool) {
    let space = max.saturating_sub(buf.len());
    if space > 0 {
        let to_copy = data.len().min(space);
        buf.extend_from_slice(&data[..to_copy]);
        if data.len() > space {
            *truncated = true;
        }
    } else {
        *truncated = true;
    }
}

/// Drain remaining data from a stream up to the limit.
///
/// Uses non-blocking reads to avoid hanging on grandchild processes
/// that may still hold the pipe open after the direct child exits.
#[cfg(unix)]
fn drain_to_limit<R: Read + std::os::unix::io::AsRawFd>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
    truncated: &mut bool,
) -> std::io::Result<()> {
    let mut chunk = vec![0u8; 8192];
    loop {
        if *truncated {
            break;
        }
        match try_read_nonblocking(stream, &mut chunk) {
            Ok(0) => break,
            Ok(n) => append_capped(buf, &chunk[..n], max, truncated),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn drain_to_limit(
    stream: &mut impl Read,
    buf: &mut Vec<u8>,
    max: usize,
    truncated: &mut bool,
) -> std::io::Result<()> {
    let mut chunk = vec![0u8; 8192];
    loop {
        if *truncated {
            break;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        append_capped(buf, &chunk[..n], max, truncated);
    }
    Ok(())
}

/// Kill a process with SIGTERM, then SIGKILL after grace period.
#[cfg(unix)]
fn kill_with_grace(child: &mut Child) {
    let pid = child.id() as i32;

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    debug!(pid, "sent SIGTERM");

    let deadline = Instant::now() + Duration::from_millis(SIGTERM_GRACE_MS);
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => {
                trace!(pid, "process exited after SIGTERM");
                return;
            }
            Ok(None) => thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                error!(pid, error = %e, "failed to check process status");
                break;
            }
        }
    }

    warn!(pid, "process did not exit after SIGTERM, sending SIGKILL");
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_with_grace(child: &mut Child) {
    let _ = child.kill();
}

/// Try to read from a stream without blocking.
///
/// Sets O_NONBLOCK on the file descriptor for the duration of one read.
/// Returns Ok(0) if no data is available (EAGAIN/EWOULDBLOCK).
#[cfg(unix)]
fn try_read_nonblocking<R: Read + std::os::unix::io::AsRawFd>(
    stream: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let fd = stream.as_raw_fd();

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let was_nonblocking = (flags & libc::O_NONBLOCK) != 0;
    if !was_nonblocking {
        let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if result < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    let result = stream.read(buf);

    if !was_nonblocking {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags);
        }
    }

    match result {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn try_read_nonblocking<R: Read>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    stream.read(buf)
}
