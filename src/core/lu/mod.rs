//! The Logical Unit framework (§4.4): one LU per opcode, each declaring its
//! lock requirements and hook environment, with a `CheckPrereq` / `Exec`
//! lifecycle run by the `Processor`. Grounded on
//! `examples/original_source/lib/cmdlib.py`'s `LogicalUnit` base class
//! (`CheckPrereq`/`Exec`/`BuildHooksEnv`/`HooksCallBack`), reimplemented as
//! a Rust trait per the crate's `core::commands::CommandExt`-style
//! composite-trait idiom generalized from "one command enum + flags" to
//! "one LU impl + lock plan + hook phases".

mod add_node;
mod create_instance;
mod failover_instance;
mod init_cluster;
mod migrate_instance;
mod remove_node;
mod replace_disks;
mod shutdown_instance;
mod start_instance;
mod verify_cluster;

pub use add_node::AddNodeLu;
pub use create_instance::CreateInstanceLu;
pub use failover_instance::FailoverInstanceLu;
pub use init_cluster::InitClusterLu;
pub use migrate_instance::MigrateInstanceLu;
pub use remove_node::RemoveNodeLu;
pub use replace_disks::ReplaceDisksLu;
pub use shutdown_instance::ShutdownInstanceLu;
pub use start_instance::StartInstanceLu;
pub use verify_cluster::VerifyClusterLu;

use crate::config::Config;
use crate::core::cluster_config::ClusterConfigStore;
use crate::core::errors::Result;
use crate::core::hooks::ScriptResult;
use crate::core::locking::LockManager;
use crate::core::rpc::RpcClient;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared handles every LU needs to reach the rest of the system. Cheap to
/// clone (everything behind an `Arc`), built once per process and handed
/// to the `Processor`.
#[derive(Clone)]
pub struct LuContext {
    pub config: Arc<ClusterConfigStore>,
    pub locks: Arc<LockManager>,
    pub rpc: Arc<RpcClient>,
    pub settings: Arc<Config>,
}

/// Progress/log callback an LU's `Exec` reports through (§4.4). Processor
/// wires this to the job's log stream; tests typically collect into a
/// `Vec<String>`.
pub type FeedbackFn = dyn Fn(String) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLevelKind {
    Cluster,
    Instance,
    Node,
}

/// One step of an LU's lock plan (§4.4 table): which level, which names
/// (or the whole set), and shared vs exclusive. The `Processor` executes
/// the plan in the order given; `HeldLocks::check_and_advance` is the
/// actual enforcement of "levels only increase", so a buggy plan that
/// regresses a level surfaces as `LockOrderViolation` rather than silently
/// deadlocking (§8 scenario 5).
#[derive(Debug, Clone)]
pub struct LockStep {
    pub level: LockLevelKind,
    pub names: Vec<String>,
    pub all: bool,
    pub exclusive: bool,
}

impl LockStep {
    pub fn cluster_shared() -> Self {
        Self {
            level: LockLevelKind::Cluster,
            names: vec![],
            all: false,
            exclusive: false,
        }
    }

    pub fn cluster_exclusive() -> Self {
        Self {
            level: LockLevelKind::Cluster,
            names: vec![],
            all: false,
            exclusive: true,
        }
    }

    pub fn instance(names: Vec<String>, exclusive: bool) -> Self {
        Self {
            level: LockLevelKind::Instance,
            names,
            all: false,
            exclusive,
        }
    }

    pub fn node(names: Vec<String>, exclusive: bool) -> Self {
        Self {
            level: LockLevelKind::Node,
            names,
            all: false,
            exclusive,
        }
    }

    pub fn node_all_shared() -> Self {
        Self {
            level: LockLevelKind::Node,
            names: vec![],
            all: true,
            exclusive: false,
        }
    }

    pub fn instance_all_shared() -> Self {
        Self {
            level: LockLevelKind::Instance,
            names: vec![],
            all: true,
            exclusive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    None,
    Cluster,
    Node,
    Instance,
}

/// `BuildHooksEnv`'s return value (§4.4): the environment variables plus
/// which nodes receive the pre-phase and which receive the post-phase.
#[derive(Debug, Clone, Default)]
pub struct HooksEnv {
    pub vars: BTreeMap<String, String>,
    pub pre_nodes: Vec<String>,
    pub post_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhaseKind {
    Pre,
    Post,
}

/// One LU per opcode (§4.4). `check_prereq`/`exec` take `&mut self` because
/// Ganeti's idiom is "CheckPrereq populates fields Exec reads" — the LU
/// instance is itself the scratch space threading state between phases.
#[async_trait]
pub trait LogicalUnit: Send + Sync {
    fn name(&self) -> &'static str;

    fn lock_plan(&self) -> Vec<LockStep>;

    fn hook_type(&self) -> HookType {
        HookType::None
    }

    fn hook_path(&self) -> Option<&'static str> {
        None
    }

    /// Runs before any lock is taken (§4.4, grounded on `cmdlib.py`'s
    /// `ExpandNames`): an unlocked, best-effort read of cluster config to
    /// resolve names `lock_plan` needs but the opcode didn't carry directly
    /// (e.g. an instance's current primary/secondary). `check_prereq` runs
    /// again under lock and is the authoritative check — a config change
    /// racing this lookup is caught there, not here.
    async fn expand_names(&mut self, _ctx: &LuContext) -> Result<()> {
        Ok(())
    }

    /// Idempotent; may issue RPCs. Must raise a prereq-kind error if
    /// inputs are invalid or cluster state forbids the operation. No
    /// mutation happens here (§4.4, §7 error kind 1).
    async fn check_prereq(&mut self, ctx: &LuContext) -> Result<()>;

    /// The only mutating phase (§4.4). May raise an exec-kind error after
    /// mutations have occurred; no automatic rollback at this boundary.
    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value>;

    fn build_hooks_env(&self, _ctx: &LuContext) -> HooksEnv {
        HooksEnv::default()
    }

    /// May downgrade the LU's final result based on hook output (§4.4).
    /// Default: post-phase failures are reported but never flip the result.
    fn hooks_callback(
        &self,
        _phase: HookPhaseKind,
        _results: &[ScriptResult],
        prev_result: Value,
    ) -> Value {
        prev_result
    }
}
