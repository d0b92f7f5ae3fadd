//! Analysis window: one bracketed run of a machine.
//!
//! ```text
//! capture start -> machine start -> body -> machine stop -> capture stop
//! ```
//!
//! Capture strictly brackets the time the machine runs. Cleanup never
//! escalates: machine stop and capture stop failures are logged and reported
//! in the outcome, while the body's own result is returned unchanged.

use crate::capture::{CaptureOptions, CaptureSession, StopOutcome};
use crate::machine::{MachineController, PowerOffOutcome, RegisteredMachine};
use lv_common::Result;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, info_span, warn};

/// What happened to the capture during a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureReport {
    pub output_path: PathBuf,
    pub pid: Option<u32>,
    /// `None` when stopping failed.
    pub stop: Option<StopOutcome>,
}

/// Result of a completed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowOutcome<T> {
    pub value: T,
    /// `None` when the machine could not be stopped.
    pub power_off: Option<PowerOffOutcome>,
    pub capture: Option<CaptureReport>,
}

pub struct AnalysisWindow<'a> {
    controller: &'a MachineController,
    machine: &'a RegisteredMachine,
    capture: Option<CaptureOptions>,
}

impl<'a> AnalysisWindow<'a> {
    pub fn new(controller: &'a MachineController, machine: &'a RegisteredMachine) -> Self {
        Self {
            controller,
            machine,
            capture: None,
        }
    }

    /// Record network traffic for the duration of the window.
    pub fn with_capture(mut self, options: CaptureOptions) -> Self {
        self.capture = Some(options);
        self
    }

    /// Run `body` while the machine is up.
    ///
    /// A capture that cannot start aborts the window before the machine is
    /// touched. A machine that cannot start stops the capture and returns the
    /// start error.
    pub fn run<T, F>(self, body: F) -> Result<WindowOutcome<T>>
    where
        F: FnOnce(&RegisteredMachine) -> Result<T>,
    {
        let span = info_span!("window", label = %self.machine.raw_label());
        let _enter = span.enter();

        let mut capture = self.capture.map(CaptureSession::start).transpose()?;

        if let Err(e) = self.controller.start(self.machine) {
            if let Some(session) = capture.as_mut() {
                finish_capture(session);
            }
            return Err(e);
        }
        info!("analysis window open");

        let value = body(self.machine);

        let power_off = match self.controller.stop(self.machine) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "failed to stop machine after analysis");
                None
            }
        };

        let capture = capture.as_mut().map(|session| CaptureReport {
            output_path: session.output_path().to_path_buf(),
            pid: session.pid(),
            stop: finish_capture(session),
        });
        info!("analysis window closed");

        Ok(WindowOutcome {
            value: value?,
            power_off,
            capture,
        })
    }
}

fn finish_capture(session: &mut CaptureSession) -> Option<StopOutcome> {
    match session.stop() {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(error = %e, "failed to stop network capture");
            None
        }
    }
}
