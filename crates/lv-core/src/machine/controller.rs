//! Machine controller: start/stop/revert of disposable analysis machines.
//!
//! The controller holds no authoritative state about machines. Every
//! transition re-queries `vmrun list` first, since a machine can be started,
//! stopped or crash outside this process.
//!
//! `start` is deliberately not idempotent (starting a running machine is an
//! orchestration bug). `stop` is idempotent so cleanup paths never fail on a
//! machine that is already down.

use super::registry::{MachineRegistry, RegisteredMachine};
use super::vmrun;
use crate::runner::{invocation_name, CommandOutput, CommandRunner};
use lv_common::{Error, Result};
use lv_config::{PowerOnMode, VmwareConfig};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Runtime state of a machine, derived on demand from the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Stopped,
    Running,
    /// The running-state query itself failed.
    Unknown,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Stopped => write!(f, "stopped"),
            MachineState::Running => write!(f, "running"),
            MachineState::Unknown => write!(f, "unknown"),
        }
    }
}

/// What `stop` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerOffOutcome {
    /// The machine was running and has been powered off.
    PoweredOff,
    /// The machine was already stopped; nothing was done.
    AlreadyStopped,
    /// State was unknown; a hard stop was attempted and did not confirm.
    Unconfirmed,
}

impl std::fmt::Display for PowerOffOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerOffOutcome::PoweredOff => write!(f, "powered_off"),
            PowerOffOutcome::AlreadyStopped => write!(f, "already_stopped"),
            PowerOffOutcome::Unconfirmed => write!(f, "unconfirmed"),
        }
    }
}

/// Tool settings shared by every machine.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub tool_path: PathBuf,
    pub mode: PowerOnMode,
    /// Per-invocation timeout.
    pub timeout: Duration,
    /// Delay between revert and power-on.
    pub settle: Duration,
    /// Extension every image path must carry (without the dot).
    pub image_extension: String,
}

impl From<&VmwareConfig> for ControllerSettings {
    fn from(config: &VmwareConfig) -> Self {
        Self {
            tool_path: config.path.clone(),
            mode: config.mode,
            timeout: config.timeout(),
            settle: config.settle_interval(),
            image_extension: config.image_extension.trim_start_matches('.').to_string(),
        }
    }
}

/// Controls configured machines through the virtualization tool.
pub struct MachineController {
    registry: Arc<MachineRegistry>,
    settings: ControllerSettings,
    runner: Arc<dyn CommandRunner>,
    initialized: AtomicBool,
    starting: Mutex<HashSet<String>>,
}

/// Marks one image as having a `start` in flight; released on drop.
struct StartGuard<'a> {
    starting: &'a Mutex<HashSet<String>>,
    image: String,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.starting.lock() {
            set.remove(&self.image);
        }
    }
}

impl MachineController {
    pub fn new(
        registry: Arc<MachineRegistry>,
        settings: ControllerSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            registry,
            settings,
            runner,
            initialized: AtomicBool::new(false),
            starting: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Check the tool and every machine, in declared order.
    ///
    /// The first failure aborts with a configuration error naming the
    /// machine; no machine is controllable until this succeeds.
    #[instrument(skip(self), fields(identity = %self.registry.identity()))]
    pub fn initialize(&self) -> Result<()> {
        let tool = &self.settings.tool_path;
        if tool.as_os_str().is_empty() {
            return Err(Error::Config(
                "virtualization tool path missing, set vmware.path".to_string(),
            ));
        }
        if !tool.exists() {
            return Err(Error::Config(format!(
                "virtualization tool not found at {}",
                tool.display()
            )));
        }

        for machine in self.registry.machines() {
            debug!(label = %machine.raw_label(), "checking machine");
            self.check_image(machine)?;
            self.check_snapshot(machine)?;
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(machines = self.registry.len(), "machine controller initialized");
        Ok(())
    }

    fn check_image(&self, machine: &RegisteredMachine) -> Result<()> {
        let path = machine.label.image_path();
        let expected = &self.settings.image_extension;

        let extension_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(expected))
            .unwrap_or(false);
        if !extension_ok {
            return Err(Error::machine_config(
                machine.raw_label(),
                format!(
                    "image path {} does not end with .{}",
                    path.display(),
                    expected
                ),
            ));
        }

        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(Error::machine_config(
                    machine.raw_label(),
                    format!("image path {} is not a regular file", path.display()),
                ))
            }
            Err(e) => {
                return Err(Error::machine_config(
                    machine.raw_label(),
                    format!("image file {} not accessible: {}", path.display(), e),
                ))
            }
        }

        if let Err(e) = std::fs::File::open(path) {
            return Err(Error::machine_config(
                machine.raw_label(),
                format!("image file {} not readable: {}", path.display(), e),
            ));
        }

        Ok(())
    }

    fn check_snapshot(&self, machine: &RegisteredMachine) -> Result<()> {
        let args = vmrun::list_snapshots_args(machine.image());
        let invocation = self.invocation(&args);

        let output = self
            .runner
            .run(&self.settings.tool_path, &args, self.settings.timeout)
            .map_err(|e| {
                Error::machine_config(
                    machine.raw_label(),
                    format!("`{invocation}` could not be launched: {e}"),
                )
            })?;

        if !output.success() {
            return Err(Error::machine_config(
                machine.raw_label(),
                format!("`{invocation}` failed: {}", output.failure_summary()),
            ));
        }

        let snapshots = vmrun::parse_snapshot_list(&output.stdout_str()).map_err(|e| {
            Error::machine_config(
                machine.raw_label(),
                format!("unable to get snapshot list from `{invocation}`: {e}"),
            )
        })?;

        let wanted = machine.label.snapshot();
        if !snapshots.contains(wanted) {
            return Err(Error::machine_config(
                machine.raw_label(),
                format!(
                    "snapshot {:?} not found for {} (available: {})",
                    wanted,
                    machine.image(),
                    snapshots.names.join(", ")
                ),
            ));
        }

        Ok(())
    }

    fn ensure_initialized(&self, machine: &RegisteredMachine) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "machine controller has not been initialized, cannot control {}",
                machine.raw_label()
            )))
        }
    }

    /// Query the tool for the machine's state. Never fails; degrades to
    /// `Unknown` when the query cannot be interpreted.
    #[instrument(skip(self, machine), fields(label = %machine.raw_label()))]
    pub fn status(&self, machine: &RegisteredMachine) -> MachineState {
        let args = vmrun::list_args();
        let output = match self
            .runner
            .run(&self.settings.tool_path, &args, self.settings.timeout)
        {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "unable to check running status");
                return MachineState::Unknown;
            }
        };

        if !output.success() {
            warn!(
                result = %output.failure_summary(),
                "unable to check running status"
            );
            return MachineState::Unknown;
        }

        match vmrun::parse_running_list(&output.stdout_str()) {
            Ok(list) if list.contains(machine.image()) => MachineState::Running,
            Ok(_) => MachineState::Stopped,
            Err(e) => {
                warn!(error = %e, "unable to check running status");
                MachineState::Unknown
            }
        }
    }

    /// Every configured machine, in declared order.
    pub fn list_machines(&self) -> &[RegisteredMachine] {
        self.registry.machines()
    }

    /// Status of every configured machine, in declared order.
    pub fn status_all(&self) -> Vec<(&RegisteredMachine, MachineState)> {
        self.registry
            .machines()
            .iter()
            .map(|m| (m, self.status(m)))
            .collect()
    }

    /// Revert to the label's snapshot, wait for the settle interval, then
    /// power on.
    #[instrument(skip(self, machine), fields(label = %machine.raw_label()))]
    pub fn start(&self, machine: &RegisteredMachine) -> Result<()> {
        self.ensure_initialized(machine)?;
        let _guard = self.begin_start(machine)?;

        match self.status(machine) {
            MachineState::Stopped => {}
            MachineState::Running => {
                return Err(Error::operation(
                    machine.raw_label(),
                    self.invocation(&vmrun::list_args()),
                    format!("machine {} is already running", machine.image()),
                ));
            }
            MachineState::Unknown => {
                return Err(Error::operation(
                    machine.raw_label(),
                    self.invocation(&vmrun::list_args()),
                    "unable to determine running state, refusing to start",
                ));
            }
        }

        self.revert(machine)?;

        if !self.settings.settle.is_zero() {
            debug!(settle_ms = self.settings.settle.as_millis() as u64, "settling after revert");
            thread::sleep(self.settings.settle);
        }

        self.power_on(machine)?;
        info!(mode = %self.settings.mode, "machine started");
        Ok(())
    }

    fn begin_start(&self, machine: &RegisteredMachine) -> Result<StartGuard<'_>> {
        let image = machine.image().to_string();
        let mut set = self
            .starting
            .lock()
            .map_err(|_| Error::operation(machine.raw_label(), "start", "start lock poisoned"))?;
        if !set.insert(image.clone()) {
            return Err(Error::operation(
                machine.raw_label(),
                "start",
                "start already in progress for this machine",
            ));
        }
        Ok(StartGuard {
            starting: &self.starting,
            image,
        })
    }

    fn revert(&self, machine: &RegisteredMachine) -> Result<()> {
        debug!(snapshot = %machine.label.snapshot(), "reverting snapshot");
        let args = vmrun::revert_args(machine.image(), machine.label.snapshot());
        let output = self.invoke(machine, &args)?;
        if !output.success() {
            return Err(Error::operation(
                machine.raw_label(),
                self.invocation(&args),
                format!(
                    "unable to revert snapshot {:?}: {}",
                    machine.label.snapshot(),
                    output.failure_summary()
                ),
            ));
        }
        Ok(())
    }

    fn power_on(&self, machine: &RegisteredMachine) -> Result<()> {
        let mode = self.settings.mode;
        debug!(mode = %mode, "powering on");
        let args = vmrun::start_args(machine.image(), mode.as_arg());
        let output = self.invoke(machine, &args)?;

        match mode {
            PowerOnMode::Gui => {
                // GUI start can exit 0 while printing an error on stdout.
                let stdout = output.stdout_str();
                if !output.success() || !stdout.trim().is_empty() {
                    let detail = if stdout.trim().is_empty() {
                        output.failure_summary()
                    } else {
                        stdout.trim().to_string()
                    };
                    return Err(Error::operation(
                        machine.raw_label(),
                        self.invocation(&args),
                        format!("unable to start machine in GUI mode: {detail}"),
                    ));
                }
            }
            PowerOnMode::Headless => {
                if !output.success() {
                    warn!(
                        result = %output.failure_summary(),
                        "headless start reported failure, continuing"
                    );
                }
            }
        }
        Ok(())
    }

    /// Power the machine off hard. A stopped machine is a warning, not an
    /// error.
    #[instrument(skip(self, machine), fields(label = %machine.raw_label()))]
    pub fn stop(&self, machine: &RegisteredMachine) -> Result<PowerOffOutcome> {
        self.ensure_initialized(machine)?;

        match self.status(machine) {
            MachineState::Stopped => {
                warn!(image = %machine.image(), "trying to stop an already stopped machine");
                Ok(PowerOffOutcome::AlreadyStopped)
            }
            MachineState::Running => {
                self.power_off(machine)?;
                info!("machine stopped");
                Ok(PowerOffOutcome::PoweredOff)
            }
            MachineState::Unknown => match self.power_off(machine) {
                Ok(()) => {
                    info!("machine stopped (state was unknown)");
                    Ok(PowerOffOutcome::PoweredOff)
                }
                Err(e) => {
                    warn!(error = %e, "hard stop with unknown state did not confirm");
                    Ok(PowerOffOutcome::Unconfirmed)
                }
            },
        }
    }

    fn power_off(&self, machine: &RegisteredMachine) -> Result<()> {
        let args = vmrun::stop_hard_args(machine.image());
        let output = self.invoke(machine, &args)?;
        if !output.success() {
            return Err(Error::operation(
                machine.raw_label(),
                self.invocation(&args),
                format!("error shutting down machine: {}", output.failure_summary()),
            ));
        }
        Ok(())
    }

    fn invoke(&self, machine: &RegisteredMachine, args: &[String]) -> Result<CommandOutput> {
        self.runner
            .run(&self.settings.tool_path, args, self.settings.timeout)
            .map_err(|e| Error::launch(machine.raw_label(), self.invocation(args), e.to_string()))
    }

    fn invocation(&self, args: &[String]) -> String {
        invocation_name(&self.settings.tool_path, args)
    }
}
