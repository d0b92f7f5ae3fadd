//! labvm common types and errors.
//!
//! This crate provides foundational types shared across the labvm crates:
//! - Machine labels (image path + snapshot name) and their codec
//! - The unified error type with stable codes
//! - Output format specifications

pub mod error;
pub mod label;
pub mod output;

pub use error::{Error, ErrorCategory, Result};
pub use label::MachineLabel;
pub use output::OutputFormat;

/// Schema version for JSON payloads emitted by the CLI.
pub const SCHEMA_VERSION: &str = "1.0.0";
