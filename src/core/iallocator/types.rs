//! Wire types for the IAllocator input/output documents (§4.9).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    pub total_memory: u64,
    pub reserved_memory: u64,
    pub free_memory: u64,
    pub i_pri_memory: u64,
    pub i_pri_up_memory: u64,
    pub total_disk: u64,
    pub free_disk: u64,
    pub total_cpus: u32,
    pub primary_ip: String,
    pub secondary_ip: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    #[serde(default)]
    pub tags: Vec<String>,
    pub should_run: bool,
    pub vcpus: u32,
    pub memory: u64,
    pub os: String,
    pub nodes: Vec<String>,
    pub nics: Vec<serde_json::Value>,
    pub disks: Vec<u64>,
    pub disk_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AllocatorRequest {
    Allocate {
        name: String,
        disk_template: String,
        #[serde(default)]
        tags: Vec<String>,
        os: String,
        vcpus: u32,
        memory: u64,
        disks: Vec<u64>,
        disk_space_total: u64,
        nics: Vec<serde_json::Value>,
        required_nodes: usize,
    },
    Relocate {
        name: String,
        disk_space_total: u64,
        required_nodes: usize,
        relocate_from: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorInput {
    pub version: u32,
    pub cluster_name: String,
    #[serde(default)]
    pub cluster_tags: Vec<String>,
    pub hypervisor_type: String,
    pub nodes: BTreeMap<String, ClusterNodeInfo>,
    pub instances: BTreeMap<String, InstanceInfo>,
    pub request: AllocatorRequest,
}

impl AllocatorInput {
    pub fn new(cluster_name: impl Into<String>, hypervisor_type: impl Into<String>, request: AllocatorRequest) -> Self {
        Self {
            version: 1,
            cluster_name: cluster_name.into(),
            cluster_tags: vec![],
            hypervisor_type: hypervisor_type.into(),
            nodes: BTreeMap::new(),
            instances: BTreeMap::new(),
            request,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorOutput {
    pub success: bool,
    pub info: String,
    pub nodes: Vec<String>,
}
