//! Typed configuration structs.
//!
//! Every section has documented defaults so a minimal file only needs the
//! virtualization tool path and the machine list.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-invocation timeout for the virtualization tool.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Default delay between snapshot revert and power-on.
pub const DEFAULT_SETTLE_MS: u64 = 3_000;

/// Default port of the control channel inside the guest.
pub const DEFAULT_GUEST_CONTROL_PORT: u16 = 8000;

/// Default result-collection port on the analysis host.
pub const DEFAULT_RESULT_SERVER_PORT: u16 = 2042;

/// Default grace period between SIGTERM and SIGKILL when stopping capture.
pub const DEFAULT_CAPTURE_STOP_GRACE_MS: u64 = 2_000;

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub vmware: VmwareConfig,

    #[serde(default)]
    pub resultserver: ResultServerConfig,

    #[serde(default)]
    pub guest: GuestConfig,

    #[serde(default)]
    pub sniffer: SnifferConfig,

    /// Configured machines, in declared order.
    #[serde(default)]
    pub machines: Vec<MachineEntry>,
}

/// How the virtualization tool should bring a machine up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOnMode {
    /// Windowed start; synchronous, output is inspected for errors.
    #[default]
    Gui,
    /// No window; fire-and-forget once the tool launches.
    #[serde(alias = "nogui")]
    Headless,
}

impl PowerOnMode {
    /// Argument passed to `vmrun start`.
    pub fn as_arg(&self) -> &'static str {
        match self {
            PowerOnMode::Gui => "gui",
            PowerOnMode::Headless => "nogui",
        }
    }
}

impl std::fmt::Display for PowerOnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerOnMode::Gui => write!(f, "gui"),
            PowerOnMode::Headless => write!(f, "headless"),
        }
    }
}

/// `[vmware]` section: the virtualization control utility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmwareConfig {
    /// Path to the `vmrun` executable.
    pub path: PathBuf,

    #[serde(default)]
    pub mode: PowerOnMode,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Extension every image path must carry.
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
}

impl VmwareConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

fn default_settle_ms() -> u64 {
    DEFAULT_SETTLE_MS
}

fn default_image_extension() -> String {
    "vmx".to_string()
}

/// `[resultserver]` section: where the guest reports results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultServerConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for ResultServerConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.56.1".to_string(),
            port: DEFAULT_RESULT_SERVER_PORT,
        }
    }
}

/// `[guest]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConfig {
    /// Port of the agent the orchestrator talks to inside the guest.
    pub control_port: u16,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_GUEST_CONTROL_PORT,
        }
    }
}

/// `[sniffer]` section: network capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnifferConfig {
    pub enabled: bool,
    pub tcpdump: PathBuf,
    pub interface: String,
    /// Require root, setuid or file capabilities on the capture binary.
    pub require_privileged: bool,
    pub stop_grace_ms: u64,
    /// Where dumps go when no explicit path is given. See [`SnifferConfig::dump_dir`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_dir: Option<PathBuf>,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tcpdump: PathBuf::from("/usr/sbin/tcpdump"),
            interface: String::new(),
            require_privileged: true,
            stop_grace_ms: DEFAULT_CAPTURE_STOP_GRACE_MS,
            dump_dir: None,
        }
    }
}

impl SnifferConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Configured dump directory, or `<data dir>/labvm/captures`
    /// (`~/.local/share/labvm/captures` on Linux).
    pub fn dump_dir(&self) -> PathBuf {
        self.dump_dir.clone().unwrap_or_else(default_dump_dir)
    }
}

pub fn default_dump_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("labvm")
        .join("captures")
}

/// One `[[machines]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineEntry {
    /// Short name used on the command line.
    pub name: String,
    /// `"<image-path>,<snapshot-name>"`.
    pub label: String,
    /// Guest IP address, used to scope network capture.
    pub ip: String,
}

/// Flattened, read-only view of everything the controller needs for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineConfig {
    pub name: String,
    pub label: String,
    pub ip: String,
    pub result_server_host: String,
    pub result_server_port: u16,
    pub tool_path: PathBuf,
    pub power_on_mode: PowerOnMode,
}

impl SandboxConfig {
    /// Parse a TOML document. Does not validate.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Per-machine configs, in declared order.
    pub fn machine_configs(&self) -> Vec<MachineConfig> {
        self.machines
            .iter()
            .map(|entry| MachineConfig {
                name: entry.name.clone(),
                label: entry.label.clone(),
                ip: entry.ip.clone(),
                result_server_host: self.resultserver.ip.clone(),
                result_server_port: self.resultserver.port,
                tool_path: self.vmware.path.clone(),
                power_on_mode: self.vmware.mode,
            })
            .collect()
    }

    pub fn machine(&self, name: &str) -> Option<&MachineEntry> {
        self.machines.iter().find(|m| m.name == name)
    }
}
