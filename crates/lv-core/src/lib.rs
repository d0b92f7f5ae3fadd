//! labvm core library.
//!
//! Lifecycle control for disposable analysis machines, with network capture
//! bound to each run:
//! - Command runner for external tools (timeouts, output caps)
//! - Machine controller driving `vmrun` (revert, start, stop, status)
//! - tcpdump capture sessions scoped to one guest
//! - Analysis windows bracketing a run with capture
//! - Exit codes and logging for the `labvm` binary
//!
//! The binary entry point is in `main.rs`.

pub mod capture;
pub mod exit_codes;
pub mod logging;
pub mod machine;
pub mod runner;
pub mod window;

#[cfg(test)]
mod testing;

pub use capture::{CaptureFilter, CaptureOptions, CaptureSession, StopOutcome};
pub use machine::{
    ControllerSettings, MachineController, MachineRegistry, MachineState, PowerOffOutcome,
    RegisteredMachine,
};
pub use runner::{CommandOutput, CommandRunner, LaunchError, ProcessRunner};
pub use window::{AnalysisWindow, WindowOutcome};
