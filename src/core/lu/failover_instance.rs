use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::cluster_config::{AdminState, DiskKind, DiskTemplate};
use crate::core::errors::{GanetiError, Result};
use crate::core::opcodes::OpCode;
use crate::core::rpc::NodeTarget;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Non-live failover (§4.4 table, §4.6 contrast case): shuts the instance
/// down on its primary, swaps primary/secondary, and starts it on the node
/// that was previously the secondary. Unlike `MigrateInstance` there is no
/// dual-primary window — the instance is down for the whole operation.
/// Only meaningful for `drbd8` (a `plain` instance has no replica to fail
/// over to).
pub struct FailoverInstanceLu {
    instance_name: String,
    old_primary: String,
    new_primary: String,
}

impl FailoverInstanceLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::FailoverInstance { instance_name } => Ok(Self {
                instance_name: instance_name.clone(),
                old_primary: String::new(),
                new_primary: String::new(),
            }),
            _ => Err(GanetiError::Internal("FailoverInstanceLu built from wrong opcode".into())),
        }
    }
}

#[async_trait]
impl LogicalUnit for FailoverInstanceLu {
    fn name(&self) -> &'static str {
        "OpFailoverInstance"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        vec![
            LockStep::cluster_shared(),
            LockStep::instance(vec![self.instance_name.clone()], true),
            LockStep::node(vec![self.old_primary.clone(), self.new_primary.clone()], false),
        ]
    }

    fn hook_type(&self) -> HookType {
        HookType::Instance
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("instance-failover")
    }

    async fn expand_names(&mut self, ctx: &LuContext) -> Result<()> {
        if let Some(instance) = ctx.config.snapshot().find_instance(&self.instance_name) {
            self.old_primary = instance.primary_node.clone();
            if let Some(secondary) = instance.secondary_nodes.first() {
                self.new_primary = secondary.clone();
            }
        }
        Ok(())
    }

    async fn check_prereq(&mut self, ctx: &LuContext) -> Result<()> {
        let snapshot = ctx.config.snapshot();
        let instance = snapshot
            .find_instance(&self.instance_name)
            .ok_or_else(|| GanetiError::PrereqError(format!("instance '{}' not found", self.instance_name)))?;
        if instance.disk_template != DiskTemplate::Drbd8 {
            return Err(GanetiError::PrereqError("failover requires a drbd8 instance".into()));
        }
        let secondary = instance
            .secondary_nodes
            .first()
            .ok_or_else(|| GanetiError::PrereqError("drbd8 instance has no secondary node".into()))?;
        self.old_primary = instance.primary_node.clone();
        self.new_primary = secondary.clone();
        if snapshot.find_node(&self.new_primary).map(|n| n.is_offline()).unwrap_or(true) {
            return Err(GanetiError::PrereqError(format!("secondary node '{}' is offline", self.new_primary)));
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        let old_target = NodeTarget {
            name: self.old_primary.clone(),
            address: self.old_primary.clone(),
            offline: false,
        };
        let _ = ctx
            .rpc
            .call("instance_shutdown", &json!({"instance_name": self.instance_name}), &[old_target])
            .await;
        feedback(format!("instance '{}' stopped on old primary {}", self.instance_name, self.old_primary));

        let new_primary = self.new_primary.clone();
        let old_primary = self.old_primary.clone();
        ctx.config.update_instance(&self.instance_name, |inst| {
            inst.primary_node = new_primary.clone();
            inst.secondary_nodes = vec![old_primary.clone()];
            for disk in &mut inst.disks {
                if let DiskKind::Drbd8 { logical_id } = &disk.dev_type {
                    disk.dev_type = DiskKind::Drbd8 {
                        logical_id: logical_id.swapped(),
                    };
                }
            }
        })?;

        let new_target = NodeTarget {
            name: self.new_primary.clone(),
            address: self.new_primary.clone(),
            offline: false,
        };
        let results = ctx
            .rpc
            .call("instance_start", &json!({"instance_name": self.instance_name}), &[new_target])
            .await;
        if let Some(crate::core::rpc::NodeResult::Failed(msg)) = results.get(&self.new_primary) {
            return Err(GanetiError::ExecError(format!("instance_start on {}: {msg}", self.new_primary)));
        }
        ctx.config.update_instance(&self.instance_name, |i| i.admin_state = AdminState::Up)?;
        ctx.config.save_config()?;

        feedback(format!("instance '{}' failed over to {}", self.instance_name, self.new_primary));
        Ok(json!({"instance_name": self.instance_name, "new_primary": self.new_primary}))
    }

    fn build_hooks_env(&self, _ctx: &LuContext) -> HooksEnv {
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_INSTANCE_NAME".to_string(), self.instance_name.clone());
        HooksEnv {
            vars,
            pre_nodes: vec![self.old_primary.clone(), self.new_primary.clone()],
            post_nodes: vec![self.old_primary.clone(), self.new_primary.clone()],
        }
    }
}
