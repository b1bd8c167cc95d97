use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::cluster_config::{Node, NodeRole};
use crate::core::errors::{GanetiError, Result};
use crate::core::opcodes::OpCode;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Bootstraps the cluster identity and registers the master as the first
/// node (§4.4 table: InitCluster holds the BGL exclusive — it is the one
/// operation allowed to run before any other lock discipline exists).
pub struct InitClusterLu {
    cluster_name: String,
    master_node: String,
    master_ip: String,
    master_netdev: String,
    enabled_hypervisors: Vec<String>,
}

impl InitClusterLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::InitCluster {
                cluster_name,
                master_node,
                master_ip,
                master_netdev,
                enabled_hypervisors,
            } => Ok(Self {
                cluster_name: cluster_name.clone(),
                master_node: master_node.clone(),
                master_ip: master_ip.clone(),
                master_netdev: master_netdev.clone(),
                enabled_hypervisors: enabled_hypervisors.clone(),
            }),
            _ => Err(GanetiError::Internal("InitClusterLu built from wrong opcode".into())),
        }
    }
}

#[async_trait]
impl LogicalUnit for InitClusterLu {
    fn name(&self) -> &'static str {
        "OpInitCluster"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        vec![LockStep::cluster_exclusive()]
    }

    fn hook_type(&self) -> HookType {
        HookType::Cluster
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("cluster-init")
    }

    async fn check_prereq(&mut self, _ctx: &LuContext) -> Result<()> {
        if !self.cluster_name.contains('.') {
            return Err(GanetiError::PrereqError(format!(
                "cluster_name '{}' is not a valid FQDN",
                self.cluster_name
            )));
        }
        if self.master_node.trim().is_empty() || self.master_ip.trim().is_empty() {
            return Err(GanetiError::PrereqError("master_node and master_ip are required".into()));
        }
        if self.enabled_hypervisors.is_empty() {
            return Err(GanetiError::PrereqError("at least one hypervisor must be enabled".into()));
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        ctx.config.update_identity(|id| {
            id.cluster_name = self.cluster_name.clone();
            id.master_node = self.master_node.clone();
            id.master_ip = self.master_ip.clone();
            id.master_netdev = self.master_netdev.clone();
            id.enabled_hypervisors = self.enabled_hypervisors.clone();
        });

        let mut master = Node::new(self.master_node.clone(), self.master_ip.clone());
        master.role = NodeRole::Master;
        ctx.config.add_node(master)?;
        ctx.config.save_config()?;

        feedback(format!("cluster '{}' initialized, master is {}", self.cluster_name, self.master_node));
        Ok(json!({"cluster_name": self.cluster_name, "master_node": self.master_node}))
    }

    fn build_hooks_env(&self, _ctx: &LuContext) -> HooksEnv {
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_CLUSTER".to_string(), self.cluster_name.clone());
        HooksEnv {
            vars,
            pre_nodes: vec![self.master_node.clone()],
            post_nodes: vec![self.master_node.clone()],
        }
    }
}
