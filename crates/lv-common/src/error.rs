//! Error types for labvm.
//!
//! Every error that concerns a machine carries the machine label and, where a
//! tool was involved, the tool invocation that failed. These are the only
//! actionable diagnostics available to an operator: the virtualization tool's
//! own stderr is usually opaque.
//!
//! Errors serialize to structured JSON for agents:
//! ```json
//! {
//!   "code": 30,
//!   "category": "operation",
//!   "message": "/vms/win7.vmx,clean: `vmrun revertToSnapshot` failed: exit code 255",
//!   "recoverable": true
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for labvm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration loading and startup checks.
    Config,
    /// Malformed machine labels supplied by the caller.
    Label,
    /// External process could not be spawned or timed out.
    Launch,
    /// External tool ran but reported failure, or a precondition was violated.
    Operation,
    /// Network capture could not be started or stopped.
    Capture,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Label => write!(f, "label"),
            ErrorCategory::Launch => write!(f, "launch"),
            ErrorCategory::Operation => write!(f, "operation"),
            ErrorCategory::Capture => write!(f, "capture"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for labvm.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration error for machine {label}: {message}")]
    MachineConfig { label: String, message: String },

    #[error("invalid machine label {label:?}: {reason}")]
    InvalidLabel { label: String, reason: String },

    // Launch errors (20-29)
    #[error("{label}: `{invocation}` could not be launched: {message}")]
    Launch {
        label: String,
        invocation: String,
        message: String,
    },

    // Operation errors (30-39)
    #[error("{label}: `{invocation}` failed: {message}")]
    Operation {
        label: String,
        invocation: String,
        message: String,
    },

    // Capture errors (40-49)
    #[error("network capture error: {0}")]
    Capture(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a machine-scoped operation failure.
    pub fn operation(
        label: impl Into<String>,
        invocation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Operation {
            label: label.into(),
            invocation: invocation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a machine-scoped launch failure.
    pub fn launch(
        label: impl Into<String>,
        invocation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Launch {
            label: label.into(),
            invocation: invocation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a per-machine configuration failure.
    pub fn machine_config(label: impl Into<String>, message: impl Into<String>) -> Self {
        Error::MachineConfig {
            label: label.into(),
            message: message.into(),
        }
    }

    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration and label errors
    /// - 20-29: Launch errors
    /// - 30-39: Operation errors
    /// - 40-49: Capture errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::MachineConfig { .. } => 11,
            Error::InvalidLabel { .. } => 12,
            Error::Launch { .. } => 20,
            Error::Operation { .. } => 30,
            Error::Capture(_) => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::MachineConfig { .. } => ErrorCategory::Config,
            Error::InvalidLabel { .. } => ErrorCategory::Label,
            Error::Launch { .. } => ErrorCategory::Launch,
            Error::Operation { .. } => ErrorCategory::Operation,
            Error::Capture(_) => ErrorCategory::Capture,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether the caller may reasonably retry.
    ///
    /// Configuration and label errors need a human to edit something first.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) | Error::MachineConfig { .. } | Error::InvalidLabel { .. } => false,
            Error::Launch { .. } => true,
            Error::Operation { .. } => true,
            Error::Capture(_) => true,
            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }

    /// Returns the machine label this error concerns, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            Error::MachineConfig { label, .. }
            | Error::InvalidLabel { label, .. }
            | Error::Launch { label, .. }
            | Error::Operation { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::MachineConfig { .. } => "Machine Configuration Error",
            Error::InvalidLabel { .. } => "Invalid Machine Label",
            Error::Launch { .. } => "Tool Launch Failed",
            Error::Operation { .. } => "Machine Operation Failed",
            Error::Capture(_) => "Network Capture Failed",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "Serialization Error",
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => "Fix the configuration file and run 'labvm check'.",
            Error::MachineConfig { .. } => {
                "Check that the image file exists and the snapshot is listed by 'vmrun listSnapshots'."
            }
            Error::InvalidLabel { .. } => {
                "Labels must look like '<image-path>,<snapshot-name>' with both parts non-empty."
            }
            Error::Launch { .. } => {
                "Check the virtualization tool path and permissions, or raise vmware.timeout_secs."
            }
            Error::Operation { .. } => {
                "Inspect the machine in the virtualization console; it may be locked or in use."
            }
            Error::Capture(_) => {
                "Check the tcpdump path, its capabilities (setcap cap_net_raw) and the interface name."
            }
            Error::Io(_) => "Check disk space and permissions, then retry.",
            Error::Json(_) => "Internal serialization failure; please report it.",
        }
    }

    /// Render the error as a structured JSON value for agent consumption.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "code": self.code(),
            "category": self.category(),
            "message": self.to_string(),
            "recoverable": self.is_recoverable(),
            "remediation": self.remediation(),
        });
        if let Some(label) = self.label() {
            value["label"] = serde_json::Value::String(label.to_string());
        }
        value
    }

    /// Format for humans: headline, reason, fix.
    pub fn format_human(&self) -> String {
        format!(
            "✗ {}\n  Reason: {}\n  Fix: {}",
            self.headline(),
            self,
            self.remediation()
        )
    }
}
