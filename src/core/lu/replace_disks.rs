use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::cluster_config::{Disk, DiskKind, DiskTemplate, DrbdLogicalId};
use crate::core::errors::{GanetiError, Result};
use crate::core::metrics;
use crate::core::opcodes::{OpCode, ReplaceMode};
use crate::core::rpc::{NodeResult, NodeTarget};
use async_trait::async_trait;
use serde_json::{Value, json};

/// DRBD disk replacement (§4.5): `Primary` rebuilds the primary's local
/// replica in 6 steps without ever taking the instance down; `Secondary`
/// moves the replica to a new node (`remote_node`) in 7 steps, the extra
/// step being the full initial sync against the new peer rather than a
/// partial resync against data that was already in sync a moment ago.
pub struct ReplaceDisksLu {
    instance_name: String,
    mode: ReplaceMode,
    remote_node: Option<String>,
    primary_node: String,
    old_secondary: String,
    disks: Vec<Disk>,
}

/// Fresh LV pair allocated on `tgt_node` to replace one disk's data+meta
/// children in place, plus the swap-in bookkeeping for step 4. `old_data`/
/// `old_meta` are mutated in place by `swap_in` to track each LV's current
/// real name as it moves through the rename dance, so later steps (removal)
/// always address the volume that actually exists on the node right now.
struct ReplacementPair {
    old_data: Disk,
    old_meta: Disk,
    new_data: Disk,
    new_meta: Disk,
    orig_data_name: String,
    orig_meta_name: String,
}

impl ReplaceDisksLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::ReplaceDisks {
                instance_name,
                mode,
                remote_node,
            } => Ok(Self {
                instance_name: instance_name.clone(),
                mode: *mode,
                remote_node: remote_node.clone(),
                primary_node: String::new(),
                old_secondary: String::new(),
                disks: Vec::new(),
            }),
            _ => Err(GanetiError::Internal("ReplaceDisksLu built from wrong opcode".into())),
        }
    }

    fn target(name: &str) -> NodeTarget {
        NodeTarget {
            name: name.to_string(),
            address: name.to_string(),
            offline: false,
        }
    }

    fn failed(results: &std::collections::HashMap<String, NodeResult>, node: &str, what: &str) -> Result<()> {
        match results.get(node) {
            Some(NodeResult::Failed(msg)) => Err(GanetiError::ExecError(format!("{what} on {node}: {msg}"))),
            Some(NodeResult::Offline) | None => Err(GanetiError::ExecError(format!("{what} on {node}: node unreachable"))),
            _ => Ok(()),
        }
    }

    fn lv_fields(disk: &Disk) -> Result<(&str, &str)> {
        match &disk.dev_type {
            DiskKind::Lv { vg, lv_name } => Ok((vg.as_str(), lv_name.as_str())),
            _ => Err(GanetiError::ExecError("drbd8 children must be lv-backed".into())),
        }
    }

    async fn wait_sync(&self, ctx: &LuContext, node: &str, feedback: &FeedbackFn) -> Result<()> {
        for attempt in 0..60 {
            let results = ctx
                .rpc
                .call("drbd_wait_sync", &json!({"instance_name": self.instance_name}), &[Self::target(node)])
                .await;
            match results.get(node) {
                Some(NodeResult::Ok(v)) => {
                    let percent = v.get("sync_percent").and_then(Value::as_f64);
                    metrics::set_drbd_sync_percent(&self.instance_name, "0", percent);
                    if v.get("degraded").and_then(Value::as_bool) == Some(false) {
                        metrics::set_drbd_sync_percent(&self.instance_name, "0", Some(100.0));
                        return Ok(());
                    }
                }
                Some(NodeResult::Failed(msg)) => {
                    return Err(GanetiError::ExecError(format!("drbd_wait_sync on {node}: {msg}")));
                }
                _ => {}
            }
            feedback(format!("waiting for resync on {node} (attempt {attempt})"));
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
        Err(GanetiError::ExecError(format!("resync on {node} did not complete in time")))
    }

    /// §4.5 step 1: the device (and, for primary-replace, the replacement
    /// slot) must actually exist on both the target and peer node before
    /// anything is touched.
    async fn check_existence(&self, ctx: &LuContext, disk: &Disk, nodes: &[&str]) -> Result<()> {
        for node in nodes {
            let results = ctx
                .rpc
                .call("blockdev_find", &json!({"disk": disk}), &[Self::target(node)])
                .await;
            match results.get(*node) {
                Some(NodeResult::Ok(v)) if v.get("found").and_then(Value::as_bool) == Some(true) => {}
                Some(NodeResult::Failed(msg)) => {
                    return Err(GanetiError::ExecError(format!("blockdev_find on {node}: {msg}")));
                }
                _ => {
                    return Err(GanetiError::ExecError(format!("can't find device '{}' on node {node}", disk.iv_name)));
                }
            }
        }
        Ok(())
    }

    /// §4.5 step 2: the node we are NOT replacing storage on must currently
    /// be a healthy mirror, or the replace would leave the instance with no
    /// good copy while the new replica resyncs.
    async fn check_peer_consistency(&self, ctx: &LuContext, disk: &Disk, peer: &str) -> Result<()> {
        let results = ctx
            .rpc
            .call("blockdev_getmirrorstatus", &json!({"disks": [disk]}), &[Self::target(peer)])
            .await;
        match results.get(peer) {
            Some(NodeResult::Ok(Value::Array(statuses))) => {
                let degraded = statuses.first().and_then(|s| s.get("degraded")).and_then(Value::as_bool).unwrap_or(true);
                if degraded {
                    return Err(GanetiError::ExecError(format!(
                        "peer node ({peer}) has degraded storage, unsafe to replace disks"
                    )));
                }
                Ok(())
            }
            Some(NodeResult::Failed(msg)) => Err(GanetiError::ExecError(format!("blockdev_getmirrorstatus on {peer}: {msg}"))),
            _ => Err(GanetiError::ExecError(format!("no mirror status returned by {peer}"))),
        }
    }

    /// §4.5 step 3: allocates a fresh data+meta LV pair with unique names
    /// on `tgt_node`, grounded on the original's `_GenerateUniqueNames` +
    /// `_CreateBlockDevOnPrimary` dance.
    async fn allocate_replacement(&self, ctx: &LuContext, disk: &Disk, tgt_node: &str) -> Result<ReplacementPair> {
        let old_data = disk
            .data_child()
            .ok_or_else(|| GanetiError::ExecError(format!("disk '{}' missing data child", disk.iv_name)))?
            .clone();
        let old_meta = disk
            .meta_child()
            .ok_or_else(|| GanetiError::ExecError(format!("disk '{}' missing meta child", disk.iv_name)))?
            .clone();
        let (data_vg, _) = Self::lv_fields(&old_data)?;
        let (meta_vg, _) = Self::lv_fields(&old_meta)?;

        let orig_data_name = Self::lv_fields(&old_data)?.1.to_string();
        let orig_meta_name = Self::lv_fields(&old_meta)?.1.to_string();

        let uniq = ctx.config.generate_unique_id();
        let new_data = Disk::lv(data_vg, format!(".{}_data_{}", disk.iv_name, uniq), old_data.size, old_data.iv_name.clone());
        let new_meta = Disk::lv(meta_vg, format!(".{}_meta_{}", disk.iv_name, uniq), old_meta.size, old_meta.iv_name.clone());

        let body = json!({"disks": [new_data, new_meta], "instance_name": self.instance_name});
        let results = ctx.rpc.call("blockdev_addchildren", &body, &[Self::target(tgt_node)]).await;
        Self::failed(&results, tgt_node, "blockdev_addchildren")?;

        Ok(ReplacementPair {
            old_data,
            old_meta,
            new_data,
            new_meta,
            orig_data_name,
            orig_meta_name,
        })
    }

    /// §4.5 step 4: detach -> rename old LVs to `<name>_replaced-<ts>` ->
    /// rename new LVs to the vacated original names -> reassemble. The
    /// DRBD logical_id and configured LV names never change; only the
    /// physical storage backing them does.
    async fn swap_in(&self, ctx: &LuContext, disk: &Disk, tgt_node: &str, pair: &mut ReplacementPair) -> Result<()> {
        let shutdown = ctx.rpc.call("blockdev_shutdown", &json!({"disk": disk}), &[Self::target(tgt_node)]).await;
        Self::failed(&shutdown, tgt_node, "blockdev_shutdown")?;

        // Once the rename below lands, the LV backing `pair.old_data`/
        // `old_meta` carries the `_replaced-<ts>` name instead of its
        // original one; `old.dev_type` is updated in place so later steps
        // (removal) address the volume that actually exists on the node.
        let suffix = chrono::Utc::now().timestamp();
        for old in [&mut pair.old_data, &mut pair.old_meta] {
            let (_, lv_name) = Self::lv_fields(old)?;
            let new_id = format!("{lv_name}_replaced-{suffix}");
            let body = json!({"disk": &*old, "new_id": new_id});
            let result = ctx.rpc.call("blockdev_rename", &body, &[Self::target(tgt_node)]).await;
            Self::failed(&result, tgt_node, "blockdev_rename (old)")?;
            if let DiskKind::Lv { lv_name, .. } = &mut old.dev_type {
                *lv_name = new_id;
            }
        }

        for (new, new_id) in [(&pair.new_data, &pair.orig_data_name), (&pair.new_meta, &pair.orig_meta_name)] {
            let body = json!({"disk": new, "new_id": new_id});
            let result = ctx.rpc.call("blockdev_rename", &body, &[Self::target(tgt_node)]).await;
            Self::failed(&result, tgt_node, "blockdev_rename (new)")?;
        }

        let assemble = ctx.rpc.call("blockdev_assemble", &json!({"disk": disk}), &[Self::target(tgt_node)]).await;
        Self::failed(&assemble, tgt_node, "blockdev_assemble")?;
        Ok(())
    }

    /// §4.5 step 6: best-effort removal of the vacated (now `_replaced-<ts>`
    /// named) old LVs. Failures here are warned, not fatal — matching the
    /// original's "Failures are not very well handled" note for this step.
    async fn remove_old(&self, ctx: &LuContext, tgt_node: &str, pair: &ReplacementPair, feedback: &FeedbackFn) {
        let body = json!({"disks": [pair.old_data, pair.old_meta], "instance_name": self.instance_name});
        let results = ctx.rpc.call("blockdev_removechildren", &body, &[Self::target(tgt_node)]).await;
        if let Some(NodeResult::Failed(msg)) = results.get(tgt_node) {
            feedback(format!("warning: could not remove superseded LVs on {tgt_node}: {msg} (cleanup manually)"));
        }
    }
}

#[async_trait]
impl LogicalUnit for ReplaceDisksLu {
    fn name(&self) -> &'static str {
        "OpReplaceDisks"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        let mut nodes = vec![self.primary_node.clone(), self.old_secondary.clone()];
        if let Some(r) = &self.remote_node {
            nodes.push(r.clone());
        }
        vec![
            LockStep::cluster_shared(),
            LockStep::instance(vec![self.instance_name.clone()], true),
            LockStep::node(nodes, false),
        ]
    }

    fn hook_type(&self) -> HookType {
        HookType::Instance
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("instance-replace-disks")
    }

    async fn expand_names(&mut self, ctx: &LuContext) -> Result<()> {
        if let Some(instance) = ctx.config.snapshot().find_instance(&self.instance_name) {
            self.primary_node = instance.primary_node.clone();
            if let Some(secondary) = instance.secondary_nodes.first() {
                self.old_secondary = secondary.clone();
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
            return Err(GanetiError::PrereqError("replace-disks requires a drbd8 instance".into()));
        }
        self.primary_node = instance.primary_node.clone();
        self.old_secondary = instance
            .secondary_nodes
            .first()
            .cloned()
            .ok_or_else(|| GanetiError::PrereqError("drbd8 instance has no secondary node".into()))?;
        self.disks = instance.disks.clone();

        match self.mode {
            ReplaceMode::Primary => {
                if self.remote_node.is_some() {
                    return Err(GanetiError::PrereqError("remote_node is not used in primary mode".into()));
                }
            }
            ReplaceMode::Secondary => {
                let remote = self
                    .remote_node
                    .as_ref()
                    .ok_or_else(|| GanetiError::PrereqError("secondary-replace requires remote_node".into()))?;
                if remote == &self.primary_node || remote == &self.old_secondary {
                    return Err(GanetiError::PrereqError("remote_node must differ from the current pair".into()));
                }
                if snapshot.find_node(remote).map(|n| n.is_offline()).unwrap_or(true) {
                    return Err(GanetiError::PrereqError(format!("remote_node '{remote}' is offline")));
                }
            }
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        match self.mode {
            ReplaceMode::Primary => {
                let tgt_node = self.primary_node.clone();
                let oth_node = self.old_secondary.clone();
                let disks = self.disks.clone();

                feedback("step 1/6: checking device existence".into());
                for disk in &disks {
                    self.check_existence(ctx, disk, &[tgt_node.as_str(), oth_node.as_str()]).await?;
                }

                feedback("step 2/6: checking peer consistency".into());
                for disk in &disks {
                    self.check_peer_consistency(ctx, disk, &oth_node).await?;
                }

                feedback("step 3/6: allocating new storage".into());
                let mut pairs = Vec::with_capacity(disks.len());
                for disk in &disks {
                    pairs.push(self.allocate_replacement(ctx, disk, &tgt_node).await?);
                }

                feedback("step 4/6: changing drbd configuration".into());
                for (disk, pair) in disks.iter().zip(pairs.iter_mut()) {
                    self.swap_in(ctx, disk, &tgt_node, pair).await?;
                }

                feedback("step 5/6: waiting for resync".into());
                self.wait_sync(ctx, &tgt_node, feedback).await?;

                feedback("step 6/6: removing superseded volumes".into());
                for pair in &pairs {
                    self.remove_old(ctx, &tgt_node, pair, feedback).await;
                }
                ctx.config.save_config()?;
            }
            ReplaceMode::Secondary => {
                let new_secondary = self.remote_node.clone().expect("checked in check_prereq");
                let old_secondary = self.old_secondary.clone();
                let primary_node = self.primary_node.clone();
                let disks = self.disks.clone();

                feedback("step 1/7: checking device existence".into());
                for disk in &disks {
                    self.check_existence(ctx, disk, &[primary_node.as_str()]).await?;
                }

                feedback("step 2/7: checking primary node consistency".into());
                for disk in &disks {
                    self.check_peer_consistency(ctx, disk, &primary_node).await?;
                }

                feedback("step 3/7: allocating storage on new secondary".into());
                for disk in &disks {
                    let data = disk
                        .data_child()
                        .ok_or_else(|| GanetiError::ExecError(format!("disk '{}' missing data child", disk.iv_name)))?
                        .clone();
                    let meta = disk
                        .meta_child()
                        .ok_or_else(|| GanetiError::ExecError(format!("disk '{}' missing meta child", disk.iv_name)))?
                        .clone();
                    let body = json!({"disks": [data, meta], "instance_name": self.instance_name});
                    let results = ctx.rpc.call("blockdev_addchildren", &body, &[Self::target(&new_secondary)]).await;
                    Self::failed(&results, &new_secondary, "blockdev_addchildren")?;
                }

                feedback("step 4/7: creating drbd on new secondary".into());
                let mut new_disks = Vec::with_capacity(disks.len());
                for disk in &disks {
                    let DiskKind::Drbd8 { logical_id } = &disk.dev_type else {
                        return Err(GanetiError::ExecError(format!("disk '{}' is not drbd8-backed", disk.iv_name)));
                    };
                    let new_logical_id = DrbdLogicalId {
                        lhost: primary_node.clone(),
                        lport: logical_id.lport,
                        rhost: new_secondary.clone(),
                        rport: logical_id.rport,
                        local_minor: logical_id.local_minor,
                        secret: logical_id.secret.clone(),
                    };
                    let new_disk = Disk::drbd8(
                        new_logical_id,
                        disk.size,
                        disk.iv_name.clone(),
                        disk.data_child().unwrap().clone(),
                        disk.meta_child().unwrap().clone(),
                    );
                    let create = ctx
                        .rpc
                        .call("blockdev_create", &json!({"disk": new_disk, "instance_name": self.instance_name, "role": "secondary"}), &[Self::target(&new_secondary)])
                        .await;
                    Self::failed(&create, &new_secondary, "blockdev_create")?;
                    new_disks.push(new_disk);
                }

                feedback("step 5/7: shutting down drbd on old secondary".into());
                for disk in &disks {
                    let result = ctx.rpc.call("blockdev_shutdown", &json!({"disk": disk}), &[Self::target(&old_secondary)]).await;
                    if let Some(NodeResult::Failed(msg)) = result.get(&old_secondary) {
                        feedback(format!("warning: failed to shut down drbd for '{}' on old secondary: {msg}", disk.iv_name));
                    }
                }

                feedback("step 6/7: reattaching primary to new secondary and waiting for sync".into());
                let disconnect = ctx.rpc.call("drbd_disconnect_net", &json!({"disks": disks}), &[Self::target(&primary_node)]).await;
                Self::failed(&disconnect, &primary_node, "drbd_disconnect_net")?;
                let attach_primary = ctx.rpc.call("drbd_attach_net", &json!({"disks": new_disks}), &[Self::target(&primary_node)]).await;
                Self::failed(&attach_primary, &primary_node, "drbd_attach_net")?;
                self.wait_sync(ctx, &new_secondary, feedback).await?;

                feedback("step 7/7: removing old secondary's volumes and persisting configuration".into());
                for disk in &disks {
                    let remove = ctx.rpc.call("blockdev_remove", &json!({"disk": disk}), &[Self::target(&old_secondary)]).await;
                    if let Some(NodeResult::Failed(msg)) = remove.get(&old_secondary) {
                        feedback(format!("warning: could not remove old drbd/lvs for '{}' on {old_secondary}: {msg}", disk.iv_name));
                    }
                }
                let new_secondary_name = new_secondary.clone();
                ctx.config.update_instance(&self.instance_name, |inst| {
                    inst.secondary_nodes = vec![new_secondary_name.clone()];
                    for disk in &mut inst.disks {
                        if let DiskKind::Drbd8 { logical_id } = &disk.dev_type {
                            disk.dev_type = DiskKind::Drbd8 {
                                logical_id: DrbdLogicalId {
                                    lhost: logical_id.lhost.clone(),
                                    lport: logical_id.lport,
                                    rhost: new_secondary_name.clone(),
                                    rport: logical_id.rport,
                                    local_minor: logical_id.local_minor,
                                    secret: logical_id.secret.clone(),
                                },
                            };
                        }
                    }
                })?;
                ctx.config.save_config()?;
            }
        }

        feedback(format!("instance '{}' disk replacement complete", self.instance_name));
        Ok(json!({"instance_name": self.instance_name, "mode": format!("{:?}", self.mode)}))
    }

    fn build_hooks_env(&self, _ctx: &LuContext) -> HooksEnv {
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_INSTANCE_NAME".to_string(), self.instance_name.clone());
        let mut nodes = vec![self.primary_node.clone(), self.old_secondary.clone()];
        if let Some(r) = &self.remote_node {
            nodes.push(r.clone());
        }
        HooksEnv {
            vars,
            pre_nodes: nodes.clone(),
            post_nodes: nodes,
        }
    }
}
