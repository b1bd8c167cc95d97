use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::cluster_config::{Instance, Node};
use crate::core::errors::{GanetiError, Result};
use crate::core::opcodes::OpCode;
use crate::core::rpc::NodeTarget;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Registers a new node in the cluster config (§4.4 table: shared BGL,
/// exclusive on the new node name, shared over every existing node — the
/// new name never collides with an in-flight acquirer of the rest of the
/// set because `LockSet::acquire` sorts and dedups the combined name list
/// at a single level).
pub struct AddNodeLu {
    node_name: String,
    primary_ip: String,
    secondary_ip: Option<String>,
}

impl AddNodeLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::AddNode {
                node_name,
                primary_ip,
                secondary_ip,
            } => Ok(Self {
                node_name: node_name.clone(),
                primary_ip: primary_ip.clone(),
                secondary_ip: secondary_ip.clone(),
            }),
            _ => Err(GanetiError::Internal("AddNodeLu built from wrong opcode".into())),
        }
    }
}

#[async_trait]
impl LogicalUnit for AddNodeLu {
    fn name(&self) -> &'static str {
        "OpAddNode"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        vec![
            LockStep::cluster_shared(),
            LockStep::node(vec![self.node_name.clone()], true),
            LockStep::node_all_shared(),
        ]
    }

    fn hook_type(&self) -> HookType {
        HookType::Node
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("node-add")
    }

    async fn check_prereq(&mut self, ctx: &LuContext) -> Result<()> {
        Instance::validate_fqdn(&self.node_name)?;
        if ctx.config.get_node(&self.node_name).is_some() {
            return Err(GanetiError::PrereqError(format!("node '{}' already in cluster", self.node_name)));
        }
        if self.primary_ip.trim().is_empty() {
            return Err(GanetiError::PrereqError("primary_ip is required".into()));
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        let mut node = Node::new(self.node_name.clone(), self.primary_ip.clone());
        node.secondary_ip = self.secondary_ip.clone();

        let target = NodeTarget {
            name: node.name.clone(),
            address: node.primary_ip.clone(),
            offline: false,
        };
        let results = ctx.rpc.call("node_verify", &Value::Null, &[target]).await;
        if let Some(crate::core::rpc::NodeResult::Failed(msg)) = results.get(&self.node_name) {
            return Err(GanetiError::ExecError(format!("new node did not respond to verify: {msg}")));
        }

        ctx.config.add_node(node)?;
        ctx.config.save_config()?;
        feedback(format!("node '{}' added", self.node_name));
        Ok(json!({"node_name": self.node_name}))
    }

    fn build_hooks_env(&self, ctx: &LuContext) -> HooksEnv {
        let existing: Vec<String> = ctx.config.snapshot().nodes.iter().map(|n| n.name.clone()).collect();
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_NODE_NAME".to_string(), self.node_name.clone());
        vars.insert("GANETI_NODE_PIP".to_string(), self.primary_ip.clone());
        HooksEnv {
            vars,
            pre_nodes: existing.clone(),
            post_nodes: existing,
        }
    }
}
