use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::cluster_config::{AdminState, Disk, DiskTemplate, DrbdLogicalId, Instance, Nic};
use crate::core::errors::{GanetiError, Result};
use crate::core::opcodes::{DiskSpec, NicSpec, OpCode};
use crate::core::rpc::NodeTarget;
use async_trait::async_trait;
use serde_json::{Value, json};

const DEFAULT_VG: &str = "xenvg";
const META_SIZE_MIB: u64 = 128;

/// Allocates disks and registers a new instance (§4.4 table: shared BGL,
/// exclusive on the new instance name, shared on primary + secondary
/// nodes). Builds the recursive disk tree per `disk_template` and issues
/// `blockdev_create` to the owning node(s) before committing the config.
pub struct CreateInstanceLu {
    instance_name: String,
    disk_template: DiskTemplate,
    disks: Vec<DiskSpec>,
    nics: Vec<NicSpec>,
    pnode: String,
    snode: Option<String>,
    os: String,
    built_disks: Vec<Disk>,
}

impl CreateInstanceLu {
    pub fn new(op: &OpCode) -> Result<Self> {
        match op {
            OpCode::CreateInstance {
                instance_name,
                disk_template,
                disks,
                nics,
                pnode,
                snode,
                os,
            } => Ok(Self {
                instance_name: instance_name.clone(),
                disk_template: *disk_template,
                disks: disks.clone(),
                nics: nics.clone(),
                pnode: pnode.clone(),
                snode: snode.clone(),
                os: os.clone(),
                built_disks: vec![],
            }),
            _ => Err(GanetiError::Internal("CreateInstanceLu built from wrong opcode".into())),
        }
    }
}

#[async_trait]
impl LogicalUnit for CreateInstanceLu {
    fn name(&self) -> &'static str {
        "OpCreateInstance"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        let mut nodes = vec![self.pnode.clone()];
        if let Some(s) = &self.snode {
            nodes.push(s.clone());
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
        Some("instance-add")
    }

    async fn check_prereq(&mut self, ctx: &LuContext) -> Result<()> {
        Instance::validate_fqdn(&self.instance_name)?;
        let snapshot = ctx.config.snapshot();
        if snapshot.find_instance(&self.instance_name).is_some() {
            return Err(GanetiError::PrereqError(format!("instance '{}' already exists", self.instance_name)));
        }
        if snapshot.find_node(&self.pnode).is_none() {
            return Err(GanetiError::PrereqError(format!("primary node '{}' not in cluster", self.pnode)));
        }
        match self.disk_template {
            DiskTemplate::Drbd8 => {
                let snode = self
                    .snode
                    .as_ref()
                    .ok_or_else(|| GanetiError::PrereqError("drbd8 template requires a secondary node".into()))?;
                if snapshot.find_node(snode).is_none() {
                    return Err(GanetiError::PrereqError(format!("secondary node '{snode}' not in cluster")));
                }
                if snode == &self.pnode {
                    return Err(GanetiError::PrereqError("primary and secondary node must differ".into()));
                }
            }
            DiskTemplate::Plain => {
                if self.snode.is_some() {
                    return Err(GanetiError::PrereqError("plain template takes no secondary node".into()));
                }
            }
            _ => {
                return Err(GanetiError::PrereqError(format!(
                    "disk_template {:?} is not supported by this implementation",
                    self.disk_template
                )));
            }
        }
        if self.disks.is_empty() {
            return Err(GanetiError::PrereqError("at least one disk is required".into()));
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        let mut disks = Vec::with_capacity(self.disks.len());
        for (idx, spec) in self.disks.iter().enumerate() {
            let iv_name = format!("disk/{idx}");
            let uniq = ctx.config.generate_unique_id();
            let disk = match self.disk_template {
                DiskTemplate::Plain => Disk::lv(DEFAULT_VG, format!("{}.data.{}", self.instance_name, uniq), spec.size_mib, iv_name),
                DiskTemplate::Drbd8 => {
                    let snode = self.snode.clone().expect("checked in check_prereq");
                    let lport = ctx.config.allocate_port()?;
                    let minor = 0u32;
                    let logical_id = DrbdLogicalId {
                        lhost: self.pnode.clone(),
                        lport,
                        rhost: snode.clone(),
                        rport: lport,
                        local_minor: minor,
                        secret: uniq.clone(),
                    };
                    let data = Disk::lv(DEFAULT_VG, format!("{}.data.{}", self.instance_name, uniq), spec.size_mib, iv_name.clone());
                    let meta = Disk::lv(DEFAULT_VG, format!("{}.meta.{}", self.instance_name, uniq), META_SIZE_MIB, iv_name.clone());
                    Disk::drbd8(logical_id, spec.size_mib, iv_name, data, meta)
                }
                _ => unreachable!("rejected in check_prereq"),
            };
            disks.push(disk);
        }
        self.built_disks = disks.clone();

        let target = NodeTarget {
            name: self.pnode.clone(),
            address: self.pnode.clone(),
            offline: false,
        };
        for disk in &disks {
            let body = json!({"disk": disk, "instance_name": self.instance_name, "role": "primary"});
            let results = ctx.rpc.call("blockdev_create", &body, &[target.clone()]).await;
            if let Some(crate::core::rpc::NodeResult::Failed(msg)) = results.get(&self.pnode) {
                return Err(GanetiError::ExecError(format!("blockdev_create on {}: {msg}", self.pnode)));
            }
        }

        let instance = Instance {
            name: self.instance_name.clone(),
            primary_node: self.pnode.clone(),
            secondary_nodes: self.snode.clone().into_iter().collect(),
            os: self.os.clone(),
            disk_template: self.disk_template,
            disks,
            nics: self
                .nics
                .iter()
                .enumerate()
                .map(|(idx, n)| Nic {
                    mac: format!("aa:00:00:{:02x}:{:02x}:{:02x}", (idx >> 16) & 0xff, (idx >> 8) & 0xff, idx & 0xff),
                    ip: None,
                    bridge: n.bridge.clone(),
                })
                .collect(),
            admin_state: AdminState::Down,
            auto_balance: true,
            network_port: None,
        };
        instance.validate()?;
        ctx.config.add_instance(instance)?;
        ctx.config.save_config()?;

        feedback(format!("instance '{}' created on {}", self.instance_name, self.pnode));
        Ok(json!({"instance_name": self.instance_name}))
    }

    fn build_hooks_env(&self, _ctx: &LuContext) -> HooksEnv {
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("GANETI_INSTANCE_NAME".to_string(), self.instance_name.clone());
        vars.insert("GANETI_INSTANCE_OS".to_string(), self.os.clone());
        let mut nodes = vec![self.pnode.clone()];
        if let Some(s) = &self.snode {
            nodes.push(s.clone());
        }
        HooksEnv {
            vars,
            pre_nodes: nodes.clone(),
            post_nodes: nodes,
        }
    }
}
