use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::errors::{GanetiError, Result};
use crate::core::opcodes::OpCode;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Removes a node from the cluster config (§4.4 table: shared BGL,
/// exclusive on the target node only — no other node locks are needed
/// because removal does not touch any other node's disks).
pub struct RemoveNodeLu {
    node_name: String,
}

impl RemoveNodeLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::RemoveNode { node_name } => Ok(Self {
                node_name: node_name.clone(),
            }),
            _ => Err(GanetiError::Internal("RemoveNodeLu built from wrong opcode".into())),
        }
    }
}

#[async_trait]
impl LogicalUnit for RemoveNodeLu {
    fn name(&self) -> &'static str {
        "OpRemoveNode"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        vec![LockStep::cluster_shared(), LockStep::node(vec![self.node_name.clone()], true)]
    }

    fn hook_type(&self) -> HookType {
        HookType::Node
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("node-remove")
    }

    async fn check_prereq(&mut self, ctx: &LuContext) -> Result<()> {
        let snapshot = ctx.config.snapshot();
        if snapshot.find_node(&self.node_name).is_none() {
            return Err(GanetiError::PrereqError(format!("node '{}' not in cluster", self.node_name)));
        }
        if snapshot.identity.master_node == self.node_name {
            return Err(GanetiError::PrereqError("cannot remove the master node".into()));
        }
        let still_used = snapshot.instances.iter().any(|i| {
            i.primary_node == self.node_name || i.secondary_nodes.iter().any(|s| s == &self.node_name)
        });
        if still_used {
            return Err(GanetiError::PrereqError(format!(
                "node '{}' still hosts instance disks; migrate or remove them first",
                self.node_name
            )));
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        ctx.config.remove_node(&self.node_name)?;
        ctx.config.save_config()?;
        feedback(format!("node '{}' removed", self.node_name));
        Ok(json!({"node_name": self.node_name}))
    }

    fn build_hooks_env(&self, ctx: &LuContext) -> HooksEnv {
        let remaining: Vec<String> = ctx
            .config
            .snapshot()
            .nodes
            .iter()
            .map(|n| n.name.clone())
            .filter(|n| n != &self.node_name)
            .collect();
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_NODE_NAME".to_string(), self.node_name.clone());
        HooksEnv {
            vars,
            pre_nodes: remaining.clone(),
            post_nodes: remaining,
        }
    }
}
