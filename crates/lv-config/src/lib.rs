//! labvm configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for `labvm.toml`
//! - Config resolution (CLI → env → XDG → /etc)
//! - Semantic validation, run once at load time
//! - A content digest identifying the loaded configuration

pub mod load;
pub mod machines;
pub mod resolve;
pub mod validate;

pub use load::{load_config, ConfigError, ConfigOptions, LoadedConfig};
pub use machines::{
    GuestConfig, MachineConfig, MachineEntry, PowerOnMode, ResultServerConfig, SandboxConfig,
    SnifferConfig, VmwareConfig,
};
pub use resolve::{resolve_config_path, ConfigSource};
pub use validate::{validate_config, ValidationError, ValidationResult};

/// Standard config file name.
pub const CONFIG_FILENAME: &str = "labvm.toml";
