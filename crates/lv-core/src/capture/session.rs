//! A running tcpdump process bound to one guest.
//!
//! The session owns its child process. `stop` is idempotent and `Drop` stops
//! a session that was never stopped explicitly, so the process handle never
//! outlives the session.

use super::filter::CaptureFilter;
use lv_common::{Error, Result};
use lv_config::SnifferConfig;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// tcpdump that cannot open the interface exits almost immediately.
const STARTUP_WINDOW: Duration = Duration::from_millis(150);

/// Everything needed to launch a capture.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub tcpdump: PathBuf,
    pub interface: String,
    pub output_path: PathBuf,
    pub filter: CaptureFilter,
    /// Require root, setuid or file capabilities on the binary.
    pub require_privileged: bool,
    /// Wait between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
}

impl CaptureOptions {
    pub fn from_config(
        config: &SnifferConfig,
        filter: CaptureFilter,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tcpdump: config.tcpdump.clone(),
            interface: config.interface.clone(),
            output_path: output_path.into(),
            filter,
            require_privileged: config.require_privileged,
            stop_grace: config.stop_grace(),
        }
    }

    /// Full tcpdump argument list: unbuffered, quiet, no name resolution.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-U".to_string(),
            "-q".to_string(),
            "-i".to_string(),
            self.interface.clone(),
            "-n".to_string(),
            "-w".to_string(),
            self.output_path.display().to_string(),
        ];
        args.extend(self.filter.to_args());
        args
    }
}

/// How a `stop` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// No process was attached (never started, or already stopped).
    NotRunning,
    /// The process had already exited on its own.
    Exited,
    /// The process exited after SIGTERM.
    Terminated,
    /// The process ignored SIGTERM and was killed.
    Killed,
}

/// Handle on a running capture.
#[derive(Debug)]
pub struct CaptureSession {
    child: Option<Child>,
    pid: u32,
    interface: String,
    output_path: PathBuf,
    stop_grace: Duration,
}

impl CaptureSession {
    /// Validate the binary and interface, then spawn tcpdump.
    #[instrument(skip(options), fields(interface = %options.interface, host = %options.filter.guest_host()))]
    pub fn start(options: CaptureOptions) -> Result<Self> {
        check_executable(&options.tcpdump, options.require_privileged)?;

        if options.interface.trim().is_empty() {
            return Err(Error::Capture(
                "network interface not defined, network capture aborted".to_string(),
            ));
        }
        if options.filter.guest_host().trim().is_empty() {
            return Err(Error::Capture(
                "guest host address not defined, network capture aborted".to_string(),
            ));
        }

        if let Some(parent) = options.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Capture(format!(
                        "unable to create dump directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let args = options.to_args();
        debug!(tcpdump = %options.tcpdump.display(), args = ?args, "spawning capture");

        let mut child = Command::new(&options.tcpdump)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!(error = %e, "failed to start sniffer");
                Error::Capture(format!(
                    "failed to start {} (interface={}, host={}, dump path={}): {}",
                    options.tcpdump.display(),
                    options.interface,
                    options.filter.guest_host(),
                    options.output_path.display(),
                    e
                ))
            })?;

        if let Some(status) = exited_during_startup(&mut child) {
            let mut detail = first_stderr_line(&mut child);
            if detail.is_empty() {
                detail = "no diagnostic on stderr".to_string();
            }
            discard_empty_dump(&options.output_path);
            error!(status = %status, stderr = %detail, "sniffer exited during startup");
            return Err(Error::Capture(format!(
                "`{} {}` exited during startup ({}): {}",
                options.tcpdump.display(),
                args.join(" "),
                status,
                detail
            )));
        }

        let pid = child.id();
        info!(
            pid,
            dump = %options.output_path.display(),
            filter = %options.filter,
            "started sniffer"
        );

        Ok(Self {
            child: Some(child),
            pid,
            interface: options.interface,
            output_path: options.output_path,
            stop_grace: options.stop_grace,
        })
    }

    /// Process id while a process is attached.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|_| self.pid)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Whether the capture process is still alive. Reaps it if it exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(pid = self.pid, status = %status, "sniffer exited on its own");
                false
            }
            Some(Err(e)) => {
                warn!(pid = self.pid, error = %e, "unable to poll sniffer");
                false
            }
            None => false,
        }
    }

    /// Terminate the capture: SIGTERM, wait up to the grace period, then
    /// SIGKILL. Calling it again, or on a process that already exited, is a
    /// no-op that succeeds.
    #[instrument(skip(self), fields(pid = self.pid))]
    pub fn stop(&mut self) -> Result<StopOutcome> {
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome::NotRunning);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(status = %status, "sniffer already exited");
                return Ok(StopOutcome::Exited);
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "unable to poll sniffer, terminating anyway"),
        }

        send_sigterm(self.pid);

        let deadline = Instant::now() + self.stop_grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => {
                    info!("stopped sniffer");
                    return Ok(StopOutcome::Terminated);
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "unable to poll sniffer after SIGTERM");
                    break;
                }
            }
        }

        debug!("killing sniffer");
        if let Err(e) = child.kill() {
            // Exited between the last poll and the kill.
            debug!(error = %e, "error killing sniffer, continuing");
        }
        match child.wait() {
            Ok(status) => {
                info!(status = %status, "killed sniffer");
                Ok(StopOutcome::Killed)
            }
            Err(e) => Err(Error::Capture(format!(
                "unable to reap sniffer with pid {}: {}",
                self.pid, e
            ))),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.stop() {
                warn!(pid = self.pid, error = %e, "failed to stop sniffer on drop");
            }
        }
    }
}

/// Poll the fresh child for the startup window; `Some` if it already exited.
fn exited_during_startup(child: &mut Child) -> Option<ExitStatus> {
    let deadline = Instant::now() + STARTUP_WINDOW;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "unable to poll sniffer during startup");
                return None;
            }
        }
    }
}

fn first_stderr_line(child: &mut Child) -> String {
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        if let Err(e) = pipe.read_to_string(&mut stderr) {
            debug!(error = %e, "unable to read sniffer stderr");
        }
    }
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// A failed tcpdump may leave a zero-length dump behind.
fn discard_empty_dump(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() && meta.len() == 0 {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "unable to remove empty dump");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pid, error = %err, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// The capture binary must exist, be a regular file and be executable by the
/// current user. With `require_privileged`, the process must also be able to
/// open interfaces: running as root, a setuid binary, or file capabilities.
pub fn check_executable(path: &Path, require_privileged: bool) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|_| {
        Error::Capture(format!(
            "tcpdump does not exist at path {:?}, network capture aborted",
            path.display().to_string()
        ))
    })?;
    if !meta.is_file() {
        return Err(Error::Capture(format!(
            "{} is not a regular file, network capture aborted",
            path.display()
        )));
    }

    if !platform::executable_by_user(path) {
        return Err(Error::Capture(format!(
            "{} is not executable by this user, network capture aborted",
            path.display()
        )));
    }

    if require_privileged && !platform::privileged(path, &meta) {
        return Err(Error::Capture(format!(
            "{} is neither setuid nor carries capabilities and this process is not root, \
             network capture aborted",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(unix)]
mod platform {
    use std::ffi::CString;
    use std::fs::Metadata;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn c_path(path: &Path) -> Option<CString> {
        CString::new(path.as_os_str().as_bytes()).ok()
    }

    pub fn executable_by_user(path: &Path) -> bool {
        match c_path(path) {
            Some(c) => unsafe { libc::access(c.as_ptr(), libc::X_OK) == 0 },
            None => false,
        }
    }

    pub fn privileged(path: &Path, meta: &Metadata) -> bool {
        let is_root = unsafe { libc::geteuid() } == 0;
        let setuid = meta.permissions().mode() & (libc::S_ISUID as u32) != 0;
        is_root || setuid || has_file_capabilities(path)
    }

    #[cfg(target_os = "linux")]
    fn has_file_capabilities(path: &Path) -> bool {
        let Some(c) = c_path(path) else {
            return false;
        };
        let name = b"security.capability\0";
        let size = unsafe {
            libc::getxattr(
                c.as_ptr(),
                name.as_ptr() as *const libc::c_char,
                std::ptr::null_mut(),
                0,
            )
        };
        size > 0
    }

    #[cfg(not(target_os = "linux"))]
    fn has_file_capabilities(_path: &Path) -> bool {
        false
    }
}

#[cfg(not(unix))]
mod platform {
    use std::fs::Metadata;
    use std::path::Path;

    pub fn executable_by_user(_path: &Path) -> bool {
        true
    }

    pub fn privileged(_path: &Path, _meta: &Metadata) -> bool {
        true
    }
}
