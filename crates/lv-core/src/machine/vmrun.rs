//! The `vmrun` command-line contract.
//!
//! Argument construction and output parsing for the virtualization tool live
//! here so that the fragile text format is tested on its own, away from the
//! controller's control flow.
//!
//! `vmrun list` prints:
//! ```text
//! Total running VMs: 2
//! /vms/win7/win7.vmx
//! /vms/xp/xp.vmx
//! ```
//! and `vmrun listSnapshots <image>` prints:
//! ```text
//! Total snapshots: 2
//! clean
//! office-installed
//! ```
//! On failure the tool usually prints a single `Error: ...` line on stdout.

use thiserror::Error;

pub const CMD_LIST: &str = "list";
pub const CMD_LIST_SNAPSHOTS: &str = "listSnapshots";
pub const CMD_REVERT: &str = "revertToSnapshot";
pub const CMD_START: &str = "start";
pub const CMD_STOP: &str = "stop";

const RUNNING_HEADER: &str = "Total running VMs:";
const SNAPSHOT_HEADER: &str = "Total snapshots:";
const ERROR_PREFIX: &str = "Error:";

/// Why a listing could not be interpreted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListError {
    /// The tool printed nothing at all. This is a failure sentinel, never
    /// "zero entries": a healthy listing always carries its header line.
    #[error("no output from vmrun")]
    NoOutput,

    #[error("vmrun reported: {0}")]
    ToolError(String),
}

pub fn list_args() -> Vec<String> {
    vec![CMD_LIST.to_string()]
}

pub fn list_snapshots_args(image: &str) -> Vec<String> {
    vec![CMD_LIST_SNAPSHOTS.to_string(), image.to_string()]
}

pub fn revert_args(image: &str, snapshot: &str) -> Vec<String> {
    vec![
        CMD_REVERT.to_string(),
        image.to_string(),
        snapshot.to_string(),
    ]
}

pub fn start_args(image: &str, mode: &str) -> Vec<String> {
    vec![CMD_START.to_string(), image.to_string(), mode.to_string()]
}

/// Hard stop: immediate power-off, no guest cooperation.
pub fn stop_hard_args(image: &str) -> Vec<String> {
    vec![CMD_STOP.to_string(), image.to_string(), "hard".to_string()]
}

/// Images currently running, as reported by `vmrun list`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunningList {
    pub images: Vec<String>,
}

impl RunningList {
    /// Whether `image` is listed. vmrun reports absolute paths, so a
    /// relative image also matches a listed path ending in it at a path
    /// component boundary. Partial file names never match.
    pub fn contains(&self, image: &str) -> bool {
        let image = image.trim();
        let relative = image.trim_start_matches("./");
        let suffix_match = !image.starts_with('/') && !relative.is_empty();
        self.images.iter().any(|listed| {
            listed == image
                || (suffix_match
                    && listed
                        .strip_suffix(relative)
                        .is_some_and(|head| head.ends_with('/') || head.ends_with('\\')))
        })
    }
}

/// Snapshot names for one image, as reported by `vmrun listSnapshots`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotList {
    pub names: Vec<String>,
}

impl SnapshotList {
    /// Exact match on the trimmed snapshot name.
    pub fn contains(&self, snapshot: &str) -> bool {
        let snapshot = snapshot.trim();
        self.names.iter().any(|n| n == snapshot)
    }
}

pub fn parse_running_list(stdout: &str) -> Result<RunningList, ListError> {
    let images = parse_listing(stdout, RUNNING_HEADER)?;
    Ok(RunningList { images })
}

pub fn parse_snapshot_list(stdout: &str) -> Result<SnapshotList, ListError> {
    let names = parse_listing(stdout, SNAPSHOT_HEADER)?;
    Ok(SnapshotList { names })
}

fn parse_listing(stdout: &str, header: &str) -> Result<Vec<String>, ListError> {
    if stdout.trim().is_empty() {
        return Err(ListError::NoOutput);
    }

    let mut entries = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
            return Err(ListError::ToolError(message.trim().to_string()));
        }
        if line.starts_with(header) {
            continue;
        }
        entries.push(line.to_string());
    }
    Ok(entries)
}
