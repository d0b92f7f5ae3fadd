//! Configuration resolution and path discovery.
//!
//! Resolution order: CLI argument → environment variables → XDG path → /etc.

use crate::CONFIG_FILENAME;
use std::path::{Path, PathBuf};

/// Where a configuration file was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in XDG config directory.
    XdgConfig,

    /// Found in /etc/labvm/.
    SystemConfig,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
        }
    }
}

/// Environment variable names.
pub const ENV_CONFIG_PATH: &str = "LABVM_CONFIG";
pub const ENV_CONFIG_DIR: &str = "LABVM_CONFIG_DIR";

/// Application name for XDG directories.
const APP_NAME: &str = "labvm";

/// Outcome of resolution: a path and its source, or every location tried.
pub type Resolution = Result<(PathBuf, ConfigSource), Vec<PathBuf>>;

/// Resolve the configuration file path using the process environment.
///
/// Resolution order:
/// 1. Explicit CLI path (used as-is, even if missing, so the error names it)
/// 2. `LABVM_CONFIG` environment variable
/// 3. `LABVM_CONFIG_DIR` environment variable + `labvm.toml`
/// 4. XDG config directory (`~/.config/labvm/labvm.toml`)
/// 5. System config (`/etc/labvm/labvm.toml`)
pub fn resolve_config_path(cli_path: Option<&Path>) -> Resolution {
    resolve_with(
        cli_path,
        |key| std::env::var(key).ok(),
        xdg_config_dir(),
        system_config_dir(),
    )
}

/// Resolution with injectable environment lookup and directories.
pub fn resolve_with<F>(
    cli_path: Option<&Path>,
    env: F,
    xdg_dir: Option<PathBuf>,
    system_dir: PathBuf,
) -> Resolution
where
    F: Fn(&str) -> Option<String>,
{
    // 1. CLI argument
    if let Some(path) = cli_path {
        return Ok((path.to_path_buf(), ConfigSource::CliArgument));
    }

    let mut searched = Vec::new();

    // 2. Environment variable (direct path)
    if let Some(env_path) = env(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok((path, ConfigSource::Environment));
        }
        searched.push(path);
    }

    // 3. Environment variable (config dir)
    if let Some(config_dir) = env(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(CONFIG_FILENAME);
        if path.exists() {
            return Ok((path, ConfigSource::Environment));
        }
        searched.push(path);
    }

    // 4. XDG config directory
    if let Some(xdg) = xdg_dir {
        let path = xdg.join(CONFIG_FILENAME);
        if path.exists() {
            return Ok((path, ConfigSource::XdgConfig));
        }
        searched.push(path);
    }

    // 5. System config
    let system_path = system_dir.join(CONFIG_FILENAME);
    if system_path.exists() {
        return Ok((system_path, ConfigSource::SystemConfig));
    }
    searched.push(system_path);

    Err(searched)
}

/// Get the XDG config directory for labvm.
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Get the system config directory.
pub fn system_config_dir() -> PathBuf {
    PathBuf::from("/etc").join(APP_NAME)
}
