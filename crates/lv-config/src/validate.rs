//! Configuration validation errors and semantic validation.
//!
//! These checks only look at the configuration itself. Checks that need the
//! filesystem or the virtualization tool (image exists, snapshot listed) run
//! in the machine controller's `initialize`.

use crate::machines::SandboxConfig;
use lv_common::MachineLabel;
use std::collections::HashSet;
use std::net::IpAddr;
use thiserror::Error;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Upper bound for the post-revert settle interval.
pub const MAX_SETTLE_MS: u64 = 60_000;

/// Configuration validation errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Duplicate machine name: {0}")]
    DuplicateMachine(String),

    #[error("Invalid machine {name}: {message}")]
    InvalidMachine {
        name: String,
        label: String,
        message: String,
    },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::MissingField(_) => 64,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::DuplicateMachine(_) => 66,
            ValidationError::InvalidMachine { .. } => 67,
        }
    }
}

/// Validate a parsed configuration semantically.
pub fn validate_config(config: &SandboxConfig) -> ValidationResult<()> {
    if config.vmware.path.as_os_str().is_empty() {
        return Err(ValidationError::MissingField("vmware.path".to_string()));
    }

    if config.vmware.timeout_secs == 0 {
        return Err(ValidationError::InvalidValue {
            field: "vmware.timeout_secs".to_string(),
            message: "must be greater than 0".to_string(),
        });
    }

    if config.vmware.settle_ms > MAX_SETTLE_MS {
        return Err(ValidationError::InvalidValue {
            field: "vmware.settle_ms".to_string(),
            message: format!("must be at most {MAX_SETTLE_MS}, got {}", config.vmware.settle_ms),
        });
    }

    if config.vmware.image_extension.trim().is_empty() {
        return Err(ValidationError::MissingField(
            "vmware.image_extension".to_string(),
        ));
    }

    validate_ip("resultserver.ip", &config.resultserver.ip)?;
    validate_port("resultserver.port", config.resultserver.port)?;
    validate_port("guest.control_port", config.guest.control_port)?;

    if config.sniffer.enabled {
        if config.sniffer.tcpdump.as_os_str().is_empty() {
            return Err(ValidationError::MissingField("sniffer.tcpdump".to_string()));
        }
        if config.sniffer.interface.trim().is_empty() {
            return Err(ValidationError::MissingField(
                "sniffer.interface".to_string(),
            ));
        }
    }

    if config.machines.is_empty() {
        return Err(ValidationError::MissingField("machines".to_string()));
    }

    let mut seen = HashSet::new();
    for machine in &config.machines {
        if machine.name.trim().is_empty() {
            return Err(ValidationError::MissingField("machines.name".to_string()));
        }
        if !seen.insert(machine.name.as_str()) {
            return Err(ValidationError::DuplicateMachine(machine.name.clone()));
        }
        if let Err(e) = MachineLabel::decode(&machine.label) {
            return Err(ValidationError::InvalidMachine {
                name: machine.name.clone(),
                label: machine.label.clone(),
                message: e.to_string(),
            });
        }
        if machine.ip.parse::<IpAddr>().is_err() {
            return Err(ValidationError::InvalidMachine {
                name: machine.name.clone(),
                label: machine.label.clone(),
                message: format!("ip {:?} is not an IP address", machine.ip),
            });
        }
    }

    Ok(())
}

fn validate_ip(field: &str, value: &str) -> ValidationResult<()> {
    value
        .parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("{value:?} is not an IP address"),
        })
}

fn validate_port(field: &str, port: u16) -> ValidationResult<()> {
    if port == 0 {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            message: "port must be non-zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::MachineEntry;

    fn valid() -> SandboxConfig {
        SandboxConfig::from_toml_str(
            r#"
[vmware]
path = "/usr/bin/vmrun"

[resultserver]
ip = "10.0.0.1"
port = 2042

[[machines]]
name = "win7"
label = "/vms/win7.vmx,clean"
ip = "10.0.0.5"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_config_passes() {
        assert_eq!(validate_config(&valid()), Ok(()));
    }

    #[test]
    fn test_empty_tool_path() {
        let mut config = valid();
        config.vmware.path = "".into();
        assert_eq!(
            validate_config(&config),
            Err(ValidationError::MissingField("vmware.path".into()))
        );
    }

    #[test]
    fn test_zero_timeout() {
        let mut config = valid();
        config.vmware.timeout_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.code(), 65);
    }

    #[test]
    fn test_settle_interval_bound() {
        let mut config = valid();
        config.vmware.settle_ms = MAX_SETTLE_MS + 1;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvalidValue { field, .. }) if field == "vmware.settle_ms"
        ));
    }

    #[test]
    fn test_no_machines() {
        let mut config = valid();
        config.machines.clear();
        assert_eq!(
            validate_config(&config),
            Err(ValidationError::MissingField("machines".into()))
        );
    }

    #[test]
    fn test_duplicate_machine_names() {
        let mut config = valid();
        let dup = config.machines[0].clone();
        config.machines.push(dup);
        assert_eq!(
            validate_config(&config),
            Err(ValidationError::DuplicateMachine("win7".into()))
        );
    }

    #[test]
    fn test_malformed_label() {
        let mut config = valid();
        config.machines.push(MachineEntry {
            name: "bad".into(),
            label: "/vms/bad.vmx".into(),
            ip: "10.0.0.6".into(),
        });
        match validate_config(&config) {
            Err(ValidationError::InvalidMachine { name, label, .. }) => {
                assert_eq!(name, "bad");
                assert_eq!(label, "/vms/bad.vmx");
            }
            other => panic!("expected InvalidMachine, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_guest_ip() {
        let mut config = valid();
        config.machines[0].ip = "not-an-ip".into();
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvalidMachine { .. })
        ));
    }

    #[test]
    fn test_bad_result_server() {
        let mut config = valid();
        config.resultserver.ip = "localhost".into();
        assert!(validate_config(&config).is_err());

        let mut config = valid();
        config.resultserver.port = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_sniffer_requires_interface_when_enabled() {
        let mut config = valid();
        config.sniffer.enabled = true;
        assert_eq!(
            validate_config(&config),
            Err(ValidationError::MissingField("sniffer.interface".into()))
        );
        config.sniffer.interface = "vboxnet0".into();
        assert_eq!(validate_config(&config), Ok(()));
    }
}
