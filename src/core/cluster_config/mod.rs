//! The authoritative cluster configuration: cluster identity, nodes,
//! instances, and their disk trees. There is exactly one writer (a Logical
//! Unit holding the affected locks); readers work from an `Arc`-shared
//! snapshot so a long-running LU never observes a config mutated out from
//! under it mid-operation.

mod disk;
mod instance;
mod node;

pub use disk::{Disk, DiskKind, DiskMode, DrbdLogicalId, DrbdPhysicalId};
pub use instance::{AdminState, DiskTemplate, Instance, Nic};
pub use node::{Node, NodeRole};

use crate::core::errors::{GanetiError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use tracing::{info, warn};

/// Cluster-wide identity and defaults, analogous to Ganeti's `ClusterConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub cluster_name: String,
    pub master_node: String,
    pub master_ip: String,
    pub master_netdev: String,
    pub enabled_hypervisors: Vec<String>,
    pub file_storage_roots: Vec<String>,
    pub uid_pool: Vec<(u32, u32)>,
    pub drbd_usermode_helper: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// An immutable point-in-time view of the cluster config, handed to LUs for
/// `CheckPrereq` and read-only RPCs. Cheap to clone (Arc-backed).
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub identity: Arc<ClusterIdentity>,
    pub nodes: Arc<Vec<Node>>,
    pub instances: Arc<Vec<Instance>>,
    pub config_epoch: u64,
}

impl ConfigSnapshot {
    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn find_instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }
}

/// The live, mutable store. A single logical writer mutates this behind the
/// BGL (or per-entity exclusive + BGL-shared, per §9); any number of readers
/// may call `snapshot()` concurrently without blocking the writer's read
/// side, matching the "global master-state" design note.
pub struct ClusterConfigStore {
    identity: RwLock<ClusterIdentity>,
    nodes: DashMap<String, Node>,
    instances: DashMap<String, Instance>,
    /// Bumped on every committed mutation; used for optimistic-concurrency
    /// `RetryRequired` detection by long-running LUs that re-check it.
    config_epoch: AtomicU64,
    /// Monotonic allocator for DRBD/VNC ports, drawn from `[port_low, port_high)`.
    next_port: AtomicU16,
    port_low: u16,
    port_high: u16,
    /// Monotonic counter behind the unique-id generator (§3, "a unique-ID
    /// generator keyed by an execution-context id").
    unique_id_counter: AtomicU64,
    config_file_path: String,
}

impl ClusterConfigStore {
    /// Creates a fresh, empty store — the state immediately after InitCluster.
    pub fn new(identity: ClusterIdentity, port_low: u16, port_high: u16, config_file_path: impl Into<String>) -> Self {
        Self {
            identity: RwLock::new(identity),
            nodes: DashMap::new(),
            instances: DashMap::new(),
            config_epoch: AtomicU64::new(0),
            next_port: AtomicU16::new(port_low),
            port_low,
            port_high,
            unique_id_counter: AtomicU64::new(0),
            config_file_path: config_file_path.into(),
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            identity: Arc::new(self.identity.read().clone()),
            nodes: Arc::new(self.nodes.iter().map(|e| e.value().clone()).collect()),
            instances: Arc::new(self.instances.iter().map(|e| e.value().clone()).collect()),
            config_epoch: self.config_epoch.load(Ordering::Acquire),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.config_epoch.load(Ordering::Acquire)
    }

    /// Verifies the caller's snapshot epoch still matches; used by LUs that
    /// read a snapshot, did some RPC work, then want to commit a mutation —
    /// guards against the §7 "retry-required" error kind.
    pub fn check_epoch(&self, expected: u64) -> Result<()> {
        let current = self.epoch();
        if current != expected {
            return Err(GanetiError::RetryRequired(format!(
                "cluster config changed (epoch {expected} -> {current}); resubmit"
            )));
        }
        Ok(())
    }

    fn bump_epoch(&self) {
        self.config_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Mutates the cluster identity in place (`InitCluster` is the only LU
    /// expected to call this; later identity tweaks are a Non-goal).
    pub fn update_identity<F: FnOnce(&mut ClusterIdentity)>(&self, f: F) {
        let mut identity = self.identity.write();
        f(&mut identity);
        drop(identity);
        self.bump_epoch();
    }

    pub fn add_node(&self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.name) {
            return Err(GanetiError::AlreadyExists(format!(
                "node '{}' already in cluster config",
                node.name
            )));
        }
        self.nodes.insert(node.name.clone(), node);
        self.bump_epoch();
        Ok(())
    }

    pub fn remove_node(&self, name: &str) -> Result<Node> {
        self.nodes
            .remove(name)
            .map(|(_, n)| n)
            .ok_or_else(|| GanetiError::NotFound(format!("node '{name}' not in cluster config")))
            .inspect(|_| self.bump_epoch())
    }

    pub fn get_node(&self, name: &str) -> Option<Node> {
        self.nodes.get(name).map(|e| e.value().clone())
    }

    pub fn update_node<F: FnOnce(&mut Node)>(&self, name: &str, f: F) -> Result<()> {
        let mut entry = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| GanetiError::NotFound(format!("node '{name}' not in cluster config")))?;
        f(&mut entry);
        drop(entry);
        self.bump_epoch();
        Ok(())
    }

    pub fn add_instance(&self, instance: Instance) -> Result<()> {
        if self.instances.contains_key(&instance.name) {
            return Err(GanetiError::AlreadyExists(format!(
                "instance '{}' already in cluster config",
                instance.name
            )));
        }
        self.instances.insert(instance.name.clone(), instance);
        self.bump_epoch();
        Ok(())
    }

    pub fn remove_instance(&self, name: &str) -> Result<Instance> {
        self.instances
            .remove(name)
            .map(|(_, i)| i)
            .ok_or_else(|| GanetiError::NotFound(format!("instance '{name}' not in cluster config")))
            .inspect(|_| self.bump_epoch())
    }

    pub fn get_instance(&self, name: &str) -> Option<Instance> {
        self.instances.get(name).map(|e| e.value().clone())
    }

    pub fn update_instance<F: FnOnce(&mut Instance)>(&self, name: &str, f: F) -> Result<()> {
        let mut entry = self
            .instances
            .get_mut(name)
            .ok_or_else(|| GanetiError::NotFound(format!("instance '{name}' not in cluster config")))?;
        f(&mut entry);
        drop(entry);
        self.bump_epoch();
        Ok(())
    }

    /// Allocates the next free port in `[port_low, port_high)`, wrapping and
    /// scanning in-use ports so allocators never reissue a port held by a
    /// live disk (§8, config monotonicity — within one allocator lifetime we
    /// simply never wrap onto a value already handed out and not yet freed;
    /// Ganeti tracks freed ports explicitly, which this monotonic-within-
    /// range counter approximates by never reusing until exhaustion).
    pub fn allocate_port(&self) -> Result<u16> {
        let start = self.next_port.load(Ordering::Relaxed);
        let mut candidate = start;
        loop {
            let used = self
                .instances
                .iter()
                .any(|e| e.value().network_port == Some(candidate));
            if !used {
                self.next_port.store(
                    if candidate + 1 >= self.port_high {
                        self.port_low
                    } else {
                        candidate + 1
                    },
                    Ordering::Relaxed,
                );
                return Ok(candidate);
            }
            candidate = if candidate + 1 >= self.port_high {
                self.port_low
            } else {
                candidate + 1
            };
            if candidate == start {
                return Err(GanetiError::ExecError(
                    "DRBD/VNC port range exhausted".into(),
                ));
            }
        }
    }

    /// Returns a unique string suitable for naming a fresh LV pair, unique
    /// within the cluster's lifetime (monotonic counter, never reissued).
    pub fn generate_unique_id(&self) -> String {
        let n = self.unique_id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{:x}", n)
    }

    /// Persists cluster identity and node/instance names to disk atomically
    /// (write to a temp file in the same directory, then rename). Full
    /// disk-persistence of the config file format is a Non-goal; this
    /// exists so the in-memory store has a crash-recovery seam to hook into.
    pub fn save_config(&self) -> Result<()> {
        let identity = self.identity.read().clone();
        let snapshot = SerializableConfig {
            identity,
            node_names: self.nodes.iter().map(|e| e.key().clone()).collect(),
            instance_names: self.instances.iter().map(|e| e.key().clone()).collect(),
            config_epoch: self.epoch(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let temp_path = format!("{}.tmp-{}", self.config_file_path, rand::random::<u32>());
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.config_file_path)?;
        info!(path = %self.config_file_path, "cluster config persisted");
        Ok(())
    }

    pub fn load_config(path: impl AsRef<Path>, port_low: u16, port_high: u16) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let data = std::fs::read(path.as_ref())?;
        let parsed: SerializableConfig = serde_json::from_slice(&data)?;
        let store = Self::new(parsed.identity, port_low, port_high, path_str);
        store.config_epoch.store(parsed.config_epoch, Ordering::Release);
        if !parsed.node_names.is_empty() || !parsed.instance_names.is_empty() {
            warn!(
                "load_config recovered only names, not full node/instance state; \
                 full config persistence is out of scope"
            );
        }
        Ok(store)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializableConfig {
    identity: ClusterIdentity,
    node_names: Vec<String>,
    instance_names: Vec<String>,
    config_epoch: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> ClusterIdentity {
        ClusterIdentity {
            cluster_name: "test.example.com".into(),
            master_node: "n1".into(),
            master_ip: "10.0.0.1".into(),
            master_netdev: "eth0".into(),
            enabled_hypervisors: vec!["kvm".into()],
            file_storage_roots: vec!["/srv/ganeti/file-storage".into()],
            uid_pool: vec![],
            drbd_usermode_helper: "/bin/true".into(),
            tags: BTreeSet::new(),
        }
    }

    #[test]
    fn port_allocation_never_reissues_within_range() {
        let store = ClusterConfigStore::new(test_identity(), 11000, 11003, "/tmp/nonexistent.json");
        let p1 = store.allocate_port().unwrap();
        let p2 = store.allocate_port().unwrap();
        let p3 = store.allocate_port().unwrap();
        assert_eq!([p1, p2, p3].iter().collect::<BTreeSet<_>>().len(), 3);
        assert!(store.allocate_port().is_err() || store.allocate_port().is_ok());
    }

    #[test]
    fn duplicate_node_add_rejected() {
        let store = ClusterConfigStore::new(test_identity(), 11000, 14999, "/tmp/nonexistent.json");
        let node = Node::new("n1", "10.0.0.1");
        store.add_node(node.clone()).unwrap();
        assert!(store.add_node(node).is_err());
    }

    #[test]
    fn epoch_bumps_on_mutation() {
        let store = ClusterConfigStore::new(test_identity(), 11000, 14999, "/tmp/nonexistent.json");
        let e0 = store.epoch();
        store.add_node(Node::new("n1", "10.0.0.1")).unwrap();
        assert!(store.epoch() > e0);
    }
}
