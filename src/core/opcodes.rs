//! The opcode model (§3, §4.4): a job is an ordered list of opcodes; each
//! is a tagged struct with named typed fields plus `priority`, `dry_run`,
//! `depends`, `comment`. Grounded on
//! `examples/original_source/lib/opcodes.py`'s per-opcode field
//! declarations, reimplemented as a Rust enum rather than a class
//! hierarchy with declarative field lists.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Disk-replacement mode for `ReplaceDisks` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceMode {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    pub size_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    pub bridge: String,
}

/// One administrative operation (§3). Field names mirror the spec's
/// per-LU tables (§4.4, §8 scenarios) so opcodes read directly against
/// those sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum OpCode {
    InitCluster {
        cluster_name: String,
        master_node: String,
        master_ip: String,
        master_netdev: String,
        enabled_hypervisors: Vec<String>,
    },
    VerifyCluster,
    AddNode {
        node_name: String,
        primary_ip: String,
        secondary_ip: Option<String>,
    },
    RemoveNode {
        node_name: String,
    },
    CreateInstance {
        instance_name: String,
        disk_template: crate::core::cluster_config::DiskTemplate,
        disks: Vec<DiskSpec>,
        nics: Vec<NicSpec>,
        pnode: String,
        snode: Option<String>,
        os: String,
    },
    StartInstance {
        instance_name: String,
    },
    ShutdownInstance {
        instance_name: String,
    },
    FailoverInstance {
        instance_name: String,
    },
    MigrateInstance {
        instance_name: String,
        cleanup: bool,
    },
    ReplaceDisks {
        instance_name: String,
        mode: ReplaceMode,
        remote_node: Option<String>,
    },
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::InitCluster { .. } => "OpInitCluster",
            OpCode::VerifyCluster => "OpVerifyCluster",
            OpCode::AddNode { .. } => "OpAddNode",
            OpCode::RemoveNode { .. } => "OpRemoveNode",
            OpCode::CreateInstance { .. } => "OpCreateInstance",
            OpCode::StartInstance { .. } => "OpStartInstance",
            OpCode::ShutdownInstance { .. } => "OpShutdownInstance",
            OpCode::FailoverInstance { .. } => "OpFailoverInstance",
            OpCode::MigrateInstance { .. } => "OpMigrateInstance",
            OpCode::ReplaceDisks { .. } => "OpReplaceDisks",
        }
    }
}

/// A submitted opcode wrapped with job-scheduling metadata (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opcode {
    pub op: OpCode,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub depends: Vec<usize>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Opcode {
    pub fn new(op: OpCode) -> Self {
        Self {
            op,
            priority: Priority::default(),
            dry_run: false,
            depends: vec![],
            comment: None,
        }
    }
}
