//! The watcher (§4.4 Non-goals: no automatic failover — only down-instance
//! restart reconciliation; `FailoverInstance`/`MigrateInstance` stay
//! operator- or job-submitted). Grounded on the teacher's
//! `core::warden::worker::MasterMonitor` periodic-poll-and-react loop
//! shape, demoted from "detect down primary, coordinate quorum, promote a
//! replica" to "detect an instance that should be up but isn't running,
//! resubmit `StartInstance` for it".

use crate::core::jobqueue::JobQueue;
use crate::core::lu::LuContext;
use crate::core::opcodes::{OpCode, Opcode};
use crate::core::processor::Processor;
use crate::core::rpc::NodeTarget;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often the reconciliation pass runs. Grounded on no spec-given
/// constant — Ganeti's own watcher defaults to 5 minutes; this crate uses
/// the same value since nothing in the spec calls for a different one.
pub const POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Runs the reconciliation loop forever. Intended to be spawned as a
/// background task from the master's bootstrap; cooperative shutdown is
/// left to the caller aborting the task (the teacher's monitor loop has
/// the same "runs forever, caller aborts" shape).
pub async fn run(ctx: LuContext, jobs: Arc<JobQueue>, processor: Arc<Processor>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = reconcile_once(&ctx, &jobs, &processor).await {
            warn!(error = %e, "watcher reconciliation pass failed");
        }
    }
}

/// One pass: for every instance whose `admin_state` is `Up`, ask its
/// primary node whether the VM is actually running; if not, resubmit a
/// `StartInstance` job. Instances whose `admin_state` is `Down` are left
/// alone — an operator turned them off on purpose.
async fn reconcile_once(
    ctx: &LuContext,
    jobs: &Arc<JobQueue>,
    processor: &Arc<Processor>,
) -> crate::core::errors::Result<()> {
    let snapshot = ctx.config.snapshot();
    let mut restarted = 0usize;

    for instance in snapshot.instances.iter() {
        if instance.admin_state != crate::core::cluster_config::AdminState::Up {
            continue;
        }
        let Some(node) = snapshot.find_node(&instance.primary_node) else {
            continue;
        };
        if node.is_offline() {
            warn!(instance = %instance.name, node = %node.name, "primary node offline, cannot verify instance state");
            continue;
        }

        let target = NodeTarget {
            name: node.name.clone(),
            address: node.primary_ip.clone(),
            offline: false,
        };
        let results = ctx
            .rpc
            .call("instance_info", &json!({"instance_name": instance.name}), &[target])
            .await;

        let running = matches!(
            results.get(&node.name),
            Some(crate::core::rpc::NodeResult::Ok(v)) if v.get("running").and_then(serde_json::Value::as_bool) == Some(true)
        );
        if running {
            continue;
        }

        info!(instance = %instance.name, "instance should be up but isn't running; resubmitting start");
        let job = jobs.submit(vec![Opcode::new(OpCode::StartInstance {
            instance_name: instance.name.clone(),
        })]);
        let processor = processor.clone();
        let jobs_for_run = jobs.clone();
        let job_for_run = job.clone();
        tokio::spawn(async move {
            let _ = jobs_for_run.run_job(&processor, &job_for_run).await;
        });
        restarted += 1;
    }

    if restarted > 0 {
        info!(count = restarted, "watcher resubmitted start jobs");
    }
    Ok(())
}
