//! Registry of configured machines.
//!
//! Built once from a validated configuration and handed to the controller.
//! Entries keep the declared order, which is also the order in which
//! `initialize` checks them.

use lv_common::{Error, MachineLabel, Result};
use lv_config::{MachineConfig, SandboxConfig};
use serde::Serialize;

/// A configured machine with its decoded label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredMachine {
    pub config: MachineConfig,
    pub label: MachineLabel,
}

impl RegisteredMachine {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The raw label, used to tag diagnostics.
    pub fn raw_label(&self) -> &str {
        &self.config.label
    }

    pub fn image(&self) -> &str {
        self.label.image()
    }
}

/// Machines known to one configuration, keyed by the configuration identity.
#[derive(Debug, Clone)]
pub struct MachineRegistry {
    identity: String,
    machines: Vec<RegisteredMachine>,
}

impl MachineRegistry {
    /// Decode every label in declared order. The first malformed label fails
    /// the whole registry.
    pub fn from_config(config: &SandboxConfig, identity: impl Into<String>) -> Result<Self> {
        let machines = config
            .machine_configs()
            .into_iter()
            .map(|config| -> Result<RegisteredMachine> {
                let label = MachineLabel::decode(&config.label)?;
                Ok(RegisteredMachine { config, label })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            identity: identity.into(),
            machines,
        })
    }

    /// Digest of the configuration this registry was built from.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn machines(&self) -> &[RegisteredMachine] {
        &self.machines
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredMachine> {
        self.machines.iter().find(|m| m.name() == name)
    }

    /// Look up by raw label; whitespace around the parts is ignored.
    pub fn by_label(&self, label: &str) -> Option<&RegisteredMachine> {
        let wanted = MachineLabel::decode(label).ok()?;
        self.machines.iter().find(|m| m.label == wanted)
    }

    /// Resolve a machine by name, falling back to its label.
    pub fn resolve(&self, name_or_label: &str) -> Result<&RegisteredMachine> {
        self.get(name_or_label)
            .or_else(|| self.by_label(name_or_label))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown machine {name_or_label:?} (configured: {})",
                    self.machines
                        .iter()
                        .map(|m| m.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SandboxConfig {
        SandboxConfig::from_toml_str(
            r#"
[vmware]
path = "/usr/bin/vmrun"
mode = "headless"

[[machines]]
name = "win7"
label = "/vms/win7.vmx, clean"
ip = "10.0.0.5"

[[machines]]
name = "xp"
label = "/vms/xp.vmx,base"
ip = "10.0.0.6"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_registry_keeps_order_and_identity() {
        let registry = MachineRegistry::from_config(&config(), "abc123").unwrap();
        assert_eq!(registry.identity(), "abc123");
        assert_eq!(registry.len(), 2);
        let names: Vec<_> = registry.machines().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["win7", "xp"]);
        assert_eq!(registry.machines()[0].label.snapshot(), "clean");
    }

    #[test]
    fn test_resolve_by_name_or_label() {
        let registry = MachineRegistry::from_config(&config(), "id").unwrap();
        assert_eq!(registry.resolve("xp").unwrap().image(), "/vms/xp.vmx");
        assert_eq!(
            registry.resolve("/vms/win7.vmx,clean").unwrap().name(),
            "win7"
        );
        let err = registry.resolve("nope").unwrap_err();
        assert!(err.to_string().contains("win7, xp"));
    }

    #[test]
    fn test_malformed_label_rejected() {
        let mut config = config();
        config.machines[1].label = "/vms/xp.vmx".into();
        let err = MachineRegistry::from_config(&config, "id").unwrap_err();
        assert!(matches!(err, Error::InvalidLabel { .. }));
    }
}
