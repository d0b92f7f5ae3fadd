//! Exit codes for the labvm CLI.
//!
//! Exit codes communicate the outcome without requiring output parsing and
//! are a stable contract for automation.
//!
//! Exit code ranges:
//! - 0-1: Success / operational outcomes
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors
//! - 30-39: Tool or capture failures

use lv_common::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Clean = 0,

    /// `status` for a single machine that is not running
    NotRunning = 1,

    /// Invalid arguments
    ArgsError = 10,

    /// Configuration missing, malformed, or failed startup checks
    ConfigError = 11,

    /// Permission denied
    PermissionError = 12,

    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,

    /// Operation timed out
    TimeoutError = 22,

    /// The virtualization tool could not run or reported failure
    OperationFailed = 30,

    /// Network capture could not be started or stopped
    CaptureFailed = 31,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Codes below 10 are outcomes, not errors.
    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Get the code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK",
            ExitCode::NotRunning => "OK_NOT_RUNNING",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
            ExitCode::TimeoutError => "ERR_TIMEOUT",
            ExitCode::OperationFailed => "ERR_OPERATION",
            ExitCode::CaptureFailed => "ERR_CAPTURE",
        }
    }

    /// Exit code for an error surfaced to the CLI.
    pub fn for_error(error: &Error) -> Self {
        match error {
            Error::Config(_) | Error::MachineConfig { .. } | Error::InvalidLabel { .. } => {
                ExitCode::ConfigError
            }
            Error::Launch { message, .. } if message.contains("timed out") => {
                ExitCode::TimeoutError
            }
            Error::Launch { .. } | Error::Operation { .. } => ExitCode::OperationFailed,
            Error::Capture(_) => ExitCode::CaptureFailed,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ExitCode::PermissionError
            }
            Error::Io(_) => ExitCode::IoError,
            Error::Json(_) => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_values() {
        assert_eq!(ExitCode::Clean.as_i32(), 0);
        assert_eq!(ExitCode::NotRunning.as_i32(), 1);
        assert_eq!(ExitCode::ArgsError.as_i32(), 10);
        assert_eq!(ExitCode::ConfigError.as_i32(), 11);
        assert_eq!(ExitCode::PermissionError.as_i32(), 12);
        assert_eq!(ExitCode::InternalError.as_i32(), 20);
        assert_eq!(ExitCode::IoError.as_i32(), 21);
        assert_eq!(ExitCode::TimeoutError.as_i32(), 22);
        assert_eq!(ExitCode::OperationFailed.as_i32(), 30);
        assert_eq!(ExitCode::CaptureFailed.as_i32(), 31);
    }

    #[test]
    fn test_classification() {
        assert!(ExitCode::Clean.is_success());
        assert!(!ExitCode::NotRunning.is_error());
        assert!(ExitCode::ConfigError.is_error());
        assert_eq!(ExitCode::CaptureFailed.to_string(), "ERR_CAPTURE (31)");
    }

    #[test]
    fn test_for_error() {
        assert_eq!(
            ExitCode::for_error(&Error::machine_config("/vms/a.vmx,clean", "missing")),
            ExitCode::ConfigError
        );
        assert_eq!(
            ExitCode::for_error(&Error::operation("l", "vmrun stop", "exit code 1")),
            ExitCode::OperationFailed
        );
        assert_eq!(
            ExitCode::for_error(&Error::launch("l", "vmrun list", "vmrun timed out after 60s")),
            ExitCode::TimeoutError
        );
        assert_eq!(
            ExitCode::for_error(&Error::Capture("no tcpdump".into())),
            ExitCode::CaptureFailed
        );
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            ExitCode::for_error(&Error::Io(denied)),
            ExitCode::PermissionError
        );
    }
}
