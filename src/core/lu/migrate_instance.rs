use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::cluster_config::{Disk, DiskKind, DiskTemplate};
use crate::core::errors::{GanetiError, Result};
use crate::core::opcodes::OpCode;
use crate::core::rpc::NodeTarget;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Live migration (§4.6): the instance keeps running throughout. The DRBD
/// pair is briefly dual-primary so the hypervisor can stream state to the
/// target while the source still serves writes; if the hypervisor-level
/// migrate step fails, the dual-primary window is reverted in place rather
/// than left for a human to clean up (§4.6 "in-band revert").
///
/// `cleanup` re-runs only the revert-to-single-primary half, for an
/// operator re-submitting after a migration that failed outside this
/// process's supervision.
pub struct MigrateInstanceLu {
    instance_name: String,
    cleanup: bool,
    source: String,
    target: String,
    disks: Vec<Disk>,
}

impl MigrateInstanceLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::MigrateInstance { instance_name, cleanup } => Ok(Self {
                instance_name: instance_name.clone(),
                cleanup: *cleanup,
                source: String::new(),
                target: String::new(),
                disks: Vec::new(),
            }),
            _ => Err(GanetiError::Internal("MigrateInstanceLu built from wrong opcode".into())),
        }
    }

    async fn set_dual_primary(&self, ctx: &LuContext, dual: bool) -> Result<()> {
        let source = NodeTarget {
            name: self.source.clone(),
            address: self.source.clone(),
            offline: false,
        };
        let target = NodeTarget {
            name: self.target.clone(),
            address: self.target.clone(),
            offline: false,
        };
        let body = json!({"disks": self.disks, "instance_name": self.instance_name, "dual_primary": dual});
        let r1 = ctx.rpc.call("drbd_attach_net", &body, &[source.clone()]).await;
        let r2 = ctx.rpc.call("drbd_attach_net", &body, &[target.clone()]).await;
        for (node, results) in [(&self.source, r1), (&self.target, r2)] {
            if let Some(crate::core::rpc::NodeResult::Failed(msg)) = results.get(node) {
                return Err(GanetiError::ExecError(format!("drbd_attach_net({dual}) on {node}: {msg}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LogicalUnit for MigrateInstanceLu {
    fn name(&self) -> &'static str {
        "OpMigrateInstance"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        vec![
            LockStep::cluster_shared(),
            LockStep::instance(vec![self.instance_name.clone()], true),
            LockStep::node(vec![self.source.clone(), self.target.clone()], false),
        ]
    }

    fn hook_type(&self) -> HookType {
        HookType::Instance
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("instance-migrate")
    }

    async fn expand_names(&mut self, ctx: &LuContext) -> Result<()> {
        if let Some(instance) = ctx.config.snapshot().find_instance(&self.instance_name) {
            self.source = instance.primary_node.clone();
            if let Some(secondary) = instance.secondary_nodes.first() {
                self.target = secondary.clone();
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
            return Err(GanetiError::PrereqError("live migration requires a drbd8 instance".into()));
        }
        let secondary = instance
            .secondary_nodes
            .first()
            .ok_or_else(|| GanetiError::PrereqError("drbd8 instance has no secondary node".into()))?;
        self.source = instance.primary_node.clone();
        self.target = secondary.clone();
        self.disks = instance.disks.clone();
        if snapshot.find_node(&self.target).map(|n| n.is_offline()).unwrap_or(true) {
            return Err(GanetiError::PrereqError(format!("target node '{}' is offline", self.target)));
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        if self.cleanup {
            self.set_dual_primary(ctx, false).await?;
            feedback(format!("instance '{}' migration cleanup: reverted to single-primary", self.instance_name));
            return Ok(json!({"instance_name": self.instance_name, "cleanup": true}));
        }

        self.set_dual_primary(ctx, true).await?;
        feedback(format!("instance '{}' entering dual-primary for migration", self.instance_name));

        // The hypervisor migrate step runs on the SOURCE node, which is the
        // one actually issuing "migrate to target" to its hypervisor.
        let source = NodeTarget {
            name: self.source.clone(),
            address: self.source.clone(),
            offline: false,
        };
        let migrate_result = ctx
            .rpc
            .call(
                "instance_migrate",
                &json!({"instance_name": self.instance_name, "target": self.target, "live": true}),
                &[source],
            )
            .await;

        let failed = matches!(
            migrate_result.get(&self.source),
            Some(crate::core::rpc::NodeResult::Failed(_)) | Some(crate::core::rpc::NodeResult::Offline) | None
        );
        if failed {
            let msg = match migrate_result.get(&self.source) {
                Some(crate::core::rpc::NodeResult::Failed(m)) => m.clone(),
                _ => "no response".to_string(),
            };
            self.set_dual_primary(ctx, false).await?;
            return Err(GanetiError::ExecError(format!(
                "hypervisor migrate of '{}' to {} failed ({msg}); reverted to single-primary on {}",
                self.instance_name, self.target, self.source
            )));
        }

        self.set_dual_primary(ctx, false).await?;

        let source = self.source.clone();
        let target = self.target.clone();
        ctx.config.update_instance(&self.instance_name, |inst| {
            inst.primary_node = target.clone();
            inst.secondary_nodes = vec![source.clone()];
            for disk in &mut inst.disks {
                if let DiskKind::Drbd8 { logical_id } = &disk.dev_type {
                    disk.dev_type = DiskKind::Drbd8 {
                        logical_id: logical_id.swapped(),
                    };
                }
            }
        })?;
        ctx.config.save_config()?;

        feedback(format!("instance '{}' migrated live to {}", self.instance_name, self.target));
        Ok(json!({"instance_name": self.instance_name, "new_primary": self.target}))
    }

    fn build_hooks_env(&self, _ctx: &LuContext) -> HooksEnv {
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_INSTANCE_NAME".to_string(), self.instance_name.clone());
        HooksEnv {
            vars,
            pre_nodes: vec![self.source.clone(), self.target.clone()],
            post_nodes: vec![self.source.clone(), self.target.clone()],
        }
    }
}
