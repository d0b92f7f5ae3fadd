//! Machine control: the `vmrun` contract, the configured machine registry and
//! the controller driving both.

pub mod controller;
pub mod registry;
pub mod vmrun;

pub use controller::{ControllerSettings, MachineController, MachineState, PowerOffOutcome};
pub use registry::{MachineRegistry, RegisteredMachine};
