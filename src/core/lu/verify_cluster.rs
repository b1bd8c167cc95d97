use super::{FeedbackFn, HookType, HooksEnv, LockStep, LogicalUnit, LuContext};
use crate::core::errors::Result;
use crate::core::rpc::NodeTarget;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Cluster-wide health check (§4.4 table: shared BGL + shared over every
/// instance and node — it only reads). Fans `node_verify` out to every
/// known node and reports which ones failed or were skipped as offline.
pub struct VerifyClusterLu {
    failures: Vec<String>,
    checked: usize,
}

impl VerifyClusterLu {
    pub fn new() -> Self {
        Self {
            failures: vec![],
            checked: 0,
        }
    }
}

impl Default for VerifyClusterLu {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogicalUnit for VerifyClusterLu {
    fn name(&self) -> &'static str {
        "OpVerifyCluster"
    }

    fn lock_plan(&self) -> Vec<LockStep> {
        vec![
            LockStep::cluster_shared(),
            LockStep::instance_all_shared(),
            LockStep::node_all_shared(),
        ]
    }

    fn hook_type(&self) -> HookType {
        HookType::Cluster
    }

    fn hook_path(&self) -> Option<&'static str> {
        Some("cluster-verify")
    }

    async fn check_prereq(&mut self, _ctx: &LuContext) -> Result<()> {
        Ok(())
    }

    async fn exec(&mut self, ctx: &LuContext, feedback: &FeedbackFn) -> Result<Value> {
        let snapshot = ctx.config.snapshot();
        let targets: Vec<NodeTarget> = snapshot
            .nodes
            .iter()
            .map(|n| NodeTarget {
                name: n.name.clone(),
                address: n.primary_ip.clone(),
                offline: n.is_offline(),
            })
            .collect();
        self.checked = targets.len();

        let results = ctx.rpc.call("node_verify", &Value::Null, &targets).await;
        for (node, result) in &results {
            match result {
                crate::core::rpc::NodeResult::Ok(_) => {}
                crate::core::rpc::NodeResult::Failed(msg) => {
                    self.failures.push(format!("{node}: {msg}"));
                }
                crate::core::rpc::NodeResult::Offline => {
                    feedback(format!("{node}: skipped (offline)"));
                }
            }
        }

        Ok(json!({
            "checked": self.checked,
            "failures": self.failures,
        }))
    }

    fn build_hooks_env(&self, ctx: &LuContext) -> HooksEnv {
        let names: Vec<String> = ctx.config.snapshot().nodes.iter().map(|n| n.name.clone()).collect();
        HooksEnv {
            vars: std::collections::BTreeMap::new(),
            pre_nodes: names.clone(),
            post_nodes: names,
        }
    }
}
