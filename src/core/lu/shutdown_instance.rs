use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::cluster_config::AdminState;
use crate::core::errors::{GanetiError, Result};
use crate::core::opcodes::OpCode;
use crate::core::rpc::NodeTarget;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Stops a running instance's VM on its primary node (§4.4 table: shared
/// BGL, exclusive on the instance, shared on the primary node).
pub struct ShutdownInstanceLu {
    instance_name: String,
    primary_node: String,
}

impl ShutdownInstanceLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::ShutdownInstance { instance_name } => Ok(Self {
                instance_name: instance_name.clone(),
                primary_node: String::new(),
            }),
            _ => Err(GanetiError::Internal("ShutdownInstanceLu built from wrong opcode".into())),
        }
    }
}

#[async_trait]
impl LogicalUnit for ShutdownInstanceLu {
    fn name(&self) -> &'static str {
        "OpShutdownInstance"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        vec![
            LockStep::cluster_shared(),
            LockStep::instance(vec![self.instance_name.clone()], true),
            LockStep::node(vec![self.primary_node.clone()], false),
        ]
    }

    fn hook_type(&self) -> HookType {
        HookType::Instance
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("instance-shutdown")
    }

    async fn expand_names(&mut self, ctx: &LuContext) -> Result<()> {
        if let Some(instance) = ctx.config.snapshot().find_instance(&self.instance_name) {
            self.primary_node = instance.primary_node.clone();
        }
        Ok(())
    }

    async fn check_prereq(&mut self, ctx: &LuContext) -> Result<()> {
        let snapshot = ctx.config.snapshot();
        let instance = snapshot
            .find_instance(&self.instance_name)
            .ok_or_else(|| GanetiError::PrereqError(format!("instance '{}' not found", self.instance_name)))?;
        self.primary_node = instance.primary_node.clone();
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        let target = NodeTarget {
            name: self.primary_node.clone(),
            address: self.primary_node.clone(),
            offline: false,
        };
        let results = ctx.rpc.call("instance_shutdown", &json!({"instance_name": self.instance_name}), &[target]).await;
        if let Some(crate::core::rpc::NodeResult::Failed(msg)) = results.get(&self.primary_node) {
            return Err(GanetiError::ExecError(format!("instance_shutdown on {}: {msg}", self.primary_node)));
        }
        ctx.config.update_instance(&self.instance_name, |i| i.admin_state = AdminState::Down)?;
        feedback(format!("instance '{}' shut down", self.instance_name));
        Ok(json!({"instance_name": self.instance_name, "admin_state": "down"}))
    }

    fn build_hooks_env(&self, _ctx: &LuContext) -> HooksEnv {
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_INSTANCE_NAME".to_string(), self.instance_name.clone());
        HooksEnv {
            vars,
            pre_nodes: vec![self.primary_node.clone()],
            post_nodes: vec![self.primary_node.clone()],
        }
    }
}
