//! Loading a configuration file from disk.

use crate::machines::SandboxConfig;
use crate::resolve::{resolve_config_path, ConfigSource};
use crate::validate::{validate_config, ValidationError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found (searched: {})", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Semantic validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<ConfigError> for lv_common::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ValidationError(ValidationError::InvalidMachine {
                label, message, ..
            }) => lv_common::Error::machine_config(label, message),
            other => lv_common::Error::Config(other.to_string()),
        }
    }
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file path (highest priority).
    pub config_path: Option<PathBuf>,
}

/// A validated configuration with provenance.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SandboxConfig,
    pub path: PathBuf,
    pub source: ConfigSource,
    /// SHA-256 of the file content; identifies this configuration.
    pub identity: String,
}

/// Resolve, read, parse and validate the configuration.
pub fn load_config(options: &ConfigOptions) -> Result<LoadedConfig, ConfigError> {
    let (path, source) = resolve_config_path(options.config_path.as_deref())
        .map_err(|searched| ConfigError::NotFound { searched })?;
    load_config_file(&path, source)
}

/// Read, parse and validate a specific file.
pub fn load_config_file(path: &Path, source: ConfigSource) -> Result<LoadedConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                searched: vec![path.to_path_buf()],
            }
        } else {
            ConfigError::IoError {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    let config = SandboxConfig::from_toml_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;

    validate_config(&config)?;

    Ok(LoadedConfig {
        config,
        path: path.to_path_buf(),
        source,
        identity: content_identity(content.as_bytes()),
    })
}

/// Compute the SHA-256 hex digest of configuration content.
pub fn content_identity(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
