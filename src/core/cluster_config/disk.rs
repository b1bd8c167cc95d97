use serde::{Deserialize, Serialize};

/// Mode a disk is attached in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskMode {
    Ro,
    Rw,
}

/// The DRBD8 logical identity: the tuple that fully describes a replicated
/// pair regardless of which node is asking (§3: `logical_id = (lhost,
/// lport, rhost, rport, local_minor, secret)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdLogicalId {
    pub lhost: String,
    pub lport: u16,
    pub rhost: String,
    pub rport: u16,
    pub local_minor: u32,
    pub secret: String,
}

impl DrbdLogicalId {
    /// The logical id as seen from the other side of the pair: local and
    /// remote swap places, the minor is shared.
    pub fn swapped(&self) -> Self {
        Self {
            lhost: self.rhost.clone(),
            lport: self.rport,
            rhost: self.lhost.clone(),
            rport: self.lport,
            local_minor: self.local_minor,
            secret: self.secret.clone(),
        }
    }
}

/// Physical identity resolved at runtime, per node: the actual device path
/// and kernel major/minor once attached. Distinct from `DrbdLogicalId`,
/// which is host-address-independent configuration (§9, "attach to
/// existing by identity").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbdPhysicalId {
    pub dev_path: Option<String>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
}

/// One node of the recursive disk tree (§3, §9 "recursive heterogeneous
/// trees"). The tag lives in `dev_type`/`logical_id`; DRBD8 nodes carry
/// exactly two children (data LV, meta LV) per the pairing invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub dev_type: DiskKind,
    /// Size in MiB.
    pub size: u64,
    pub mode: DiskMode,
    pub iv_name: String,
    #[serde(default)]
    pub children: Vec<Disk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DiskKind {
    Lv { vg: String, lv_name: String },
    Drbd8 { logical_id: DrbdLogicalId },
    File { path: String },
    Absent,
}

impl Disk {
    pub fn lv(vg: impl Into<String>, lv_name: impl Into<String>, size: u64, iv_name: impl Into<String>) -> Self {
        Self {
            dev_type: DiskKind::Lv {
                vg: vg.into(),
                lv_name: lv_name.into(),
            },
            size,
            mode: DiskMode::Rw,
            iv_name: iv_name.into(),
            children: vec![],
        }
    }

    pub fn drbd8(logical_id: DrbdLogicalId, size: u64, iv_name: impl Into<String>, data: Disk, meta: Disk) -> Self {
        Self {
            dev_type: DiskKind::Drbd8 { logical_id },
            size,
            mode: DiskMode::Rw,
            iv_name: iv_name.into(),
            children: vec![data, meta],
        }
    }

    pub fn data_child(&self) -> Option<&Disk> {
        self.children.first()
    }

    pub fn meta_child(&self) -> Option<&Disk> {
        self.children.get(1)
    }

    /// Recursive fold used by `CombinedSyncStatus` style consumers and by
    /// `ComputeNodeTree` (§9): visits every node of the tree depth-first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Disk)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drbd_pairing_invariant_children_len() {
        let logical_id = DrbdLogicalId {
            lhost: "n1".into(),
            lport: 11000,
            rhost: "n2".into(),
            rport: 11000,
            local_minor: 20,
            secret: "s3cr3t".into(),
        };
        let data = Disk::lv("vg0", "uniq_data", 1024, "disk/0");
        let meta = Disk::lv("vg0", "uniq_meta", 128, "disk/0");
        let drbd = Disk::drbd8(logical_id, 1024, "disk/0", data, meta);
        assert_eq!(drbd.children.len(), 2);
        assert!(drbd.data_child().is_some());
        assert!(drbd.meta_child().is_some());
    }

    #[test]
    fn swapped_logical_id_exchanges_endpoints() {
        let id = DrbdLogicalId {
            lhost: "n1".into(),
            lport: 11000,
            rhost: "n2".into(),
            rport: 11001,
            local_minor: 20,
            secret: "s".into(),
        };
        let swapped = id.swapped();
        assert_eq!(swapped.lhost, "n2");
        assert_eq!(swapped.rhost, "n1");
        assert_eq!(swapped.lport, 11001);
        assert_eq!(swapped.rport, 11000);
    }
}
