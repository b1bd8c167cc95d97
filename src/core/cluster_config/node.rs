use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A node's role in the cluster (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Master,
    MasterCandidate,
    Regular,
    Drained,
    Offline,
}

/// A cluster member host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub primary_ip: String,
    /// Secondary IP used for DRBD replication traffic, if distinct from
    /// the primary network.
    pub secondary_ip: Option<String>,
    pub role: NodeRole,
    pub vm_capable: bool,
    pub master_capable: bool,
    pub group: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, primary_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_ip: primary_ip.into(),
            secondary_ip: None,
            role: NodeRole::Regular,
            vm_capable: true,
            master_capable: true,
            group: "default".to_string(),
            tags: BTreeSet::new(),
        }
    }

    /// A node's liveness for an operation is derived, not stored: an RPC to
    /// an offline node is skipped entirely and a synthetic offline result is
    /// returned in its place (§3, §4.1).
    pub fn is_offline(&self) -> bool {
        self.role == NodeRole::Offline
    }

    /// The IP replication traffic should use: secondary if configured,
    /// otherwise the primary network.
    pub fn replication_ip(&self) -> &str {
        self.secondary_ip.as_deref().unwrap_or(&self.primary_ip)
    }
}
