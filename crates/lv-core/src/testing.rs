//! Scripted command runner for tests.
//!
//! Responses are queued per subcommand (the first argument). The last queued
//! response for a subcommand is sticky, so a single `respond` call covers any
//! number of invocations.

use crate::runner::{CommandOutput, CommandRunner, LaunchError};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Scripted {
    Output(CommandOutput),
    /// The tool could not be launched.
    LaunchFailure(String),
}

impl Scripted {
    pub fn ok(stdout: &str) -> Self {
        Scripted::Output(CommandOutput::new(0, stdout, ""))
    }

    pub fn exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Scripted::Output(CommandOutput::new(code, stdout, stderr))
    }
}

/// A `CommandRunner` that records invocations and replays scripted results.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `subcommand`.
    pub fn respond(&self, subcommand: &str, response: Scripted) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subcommand.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Every recorded argument list, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Subcommands in call order.
    pub fn subcommands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|args| args.first().cloned())
            .collect()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.subcommands()
            .iter()
            .filter(|s| s.as_str() == subcommand)
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl CommandRunner for RecordingRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, LaunchError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(args.to_vec());

        let subcommand = args.first().cloned().unwrap_or_default();
        let scripted = {
            let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
            match responses.get_mut(&subcommand) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::LaunchFailure(message)) => Err(LaunchError::SpawnFailed {
                program: program.display().to_string(),
                message,
            }),
            None => Err(LaunchError::SpawnFailed {
                program: program.display().to_string(),
                message: format!("no scripted response for {subcommand:?}"),
            }),
        }
    }
}
