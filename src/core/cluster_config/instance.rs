use super::disk::Disk;
use crate::core::errors::{GanetiError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskTemplate {
    Diskless,
    Plain,
    Drbd8,
    File,
    SharedFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    pub mac: String,
    pub ip: Option<String>,
    pub bridge: String,
}

/// A VM instance entry in the cluster config (§3). Invariants are enforced
/// at construction and again on every mutating LU via `validate()`, rather
/// than being unrepresentable in the type — Ganeti's config loader accepts
/// a plain record and validates it, and this mirrors that two-phase shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub primary_node: String,
    pub secondary_nodes: Vec<String>,
    pub os: String,
    pub disk_template: DiskTemplate,
    pub disks: Vec<Disk>,
    pub nics: Vec<Nic>,
    pub admin_state: AdminState,
    pub auto_balance: bool,
    pub network_port: Option<u16>,
}

impl Instance {
    pub fn validate(&self) -> Result<()> {
        match self.disk_template {
            DiskTemplate::Drbd8 => {
                if self.secondary_nodes.len() != 1 {
                    return Err(GanetiError::PrereqError(format!(
                        "instance '{}': disk_template=drbd8 requires exactly one secondary node, got {}",
                        self.name,
                        self.secondary_nodes.len()
                    )));
                }
                for disk in &self.disks {
                    if !matches!(disk.dev_type, super::disk::DiskKind::Drbd8 { .. }) {
                        return Err(GanetiError::PrereqError(format!(
                            "instance '{}': drbd8 template requires every disk root to be a DRBD8 device",
                            self.name
                        )));
                    }
                }
            }
            DiskTemplate::Plain => {
                if !self.secondary_nodes.is_empty() {
                    return Err(GanetiError::PrereqError(format!(
                        "instance '{}': disk_template=plain requires no secondary nodes",
                        self.name
                    )));
                }
                for disk in &self.disks {
                    if !matches!(disk.dev_type, super::disk::DiskKind::Lv { .. }) {
                        return Err(GanetiError::PrereqError(format!(
                            "instance '{}': plain template requires every disk to be an LV",
                            self.name
                        )));
                    }
                }
            }
            _ => {}
        }

        let mut seen = std::collections::HashSet::new();
        for (idx, disk) in self.disks.iter().enumerate() {
            let expected = format!("disk/{idx}");
            if disk.iv_name != expected {
                return Err(GanetiError::PrereqError(format!(
                    "instance '{}': disk {} has iv_name '{}', expected canonical '{}'",
                    self.name, idx, disk.iv_name, expected
                )));
            }
            if !seen.insert(disk.iv_name.clone()) {
                return Err(GanetiError::PrereqError(format!(
                    "instance '{}': duplicate iv_name '{}'",
                    self.name, disk.iv_name
                )));
            }
        }
        Ok(())
    }

    /// FQDN-only (§6). Short names must be resolved and verified to
    /// round-trip before an instance is admitted to the config; this is the
    /// shape check, not the resolver (resolution is a caller concern since
    /// DNS is an external collaborator).
    pub fn validate_fqdn(name: &str) -> Result<()> {
        if !name.contains('.') || name.starts_with('.') || name.ends_with('.') {
            return Err(GanetiError::PrereqError(format!(
                "instance name '{name}' is not a valid FQDN"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster_config::disk::{DiskMode, DrbdLogicalId};

    fn plain_instance() -> Instance {
        Instance {
            name: "i.example.com".into(),
            primary_node: "n1".into(),
            secondary_nodes: vec![],
            os: "noop".into(),
            disk_template: DiskTemplate::Plain,
            disks: vec![Disk::lv("vg0", "uniq_data", 1024, "disk/0")],
            nics: vec![],
            admin_state: AdminState::Down,
            auto_balance: true,
            network_port: None,
        }
    }

    #[test]
    fn plain_with_secondary_rejected() {
        let mut inst = plain_instance();
        inst.secondary_nodes.push("n2".into());
        assert!(inst.validate().is_err());
    }

    #[test]
    fn drbd8_requires_exactly_one_secondary() {
        let mut inst = plain_instance();
        inst.disk_template = DiskTemplate::Drbd8;
        let logical_id = DrbdLogicalId {
            lhost: "n1".into(),
            lport: 11000,
            rhost: "n2".into(),
            rport: 11000,
            local_minor: 20,
            secret: "s".into(),
        };
        inst.disks = vec![Disk::drbd8(
            logical_id,
            1024,
            "disk/0",
            Disk::lv("vg0", "d", 1024, "disk/0"),
            Disk::lv("vg0", "m", 128, "disk/0"),
        )];
        inst.disks[0].mode = DiskMode::Rw;
        assert!(inst.validate().is_err(), "no secondaries should fail");
        inst.secondary_nodes = vec!["n2".into()];
        assert!(inst.validate().is_ok());
        inst.secondary_nodes.push("n3".into());
        assert!(inst.validate().is_err(), "two secondaries should fail");
    }

    #[test]
    fn duplicate_iv_name_rejected() {
        let mut inst = plain_instance();
        inst.disks.push(Disk::lv("vg0", "uniq2_data", 512, "disk/0"));
        assert!(inst.validate().is_err());
    }

    #[test]
    fn fqdn_validation() {
        assert!(Instance::validate_fqdn("i.example.com").is_ok());
        assert!(Instance::validate_fqdn("i").is_err());
        assert!(Instance::validate_fqdn(".example.com").is_err());
    }
}
