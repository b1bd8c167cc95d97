//! The in-memory job queue (§3, §4.4): a job is an ordered, user-submitted
//! list of opcodes; each runs through the `Processor` in order, honoring
//! `depends` indices within the same job. Disk persistence of the queue
//! (crash-recoverable job history) is an explicit Non-goal — this is the
//! scheduling/status contract only, grounded on the teacher's
//! `core::tasks` in-memory task-registration shape generalized from
//! "one map of running tasks" to "one map of jobs, each a sequence of
//! opcodes with per-opcode status and log".

use crate::core::errors::Result;
use crate::core::opcodes::Opcode;
use crate::core::processor::Processor;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpLog {
    pub status: Option<OpStatus>,
    pub messages: Vec<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    op_logs: Vec<OpLog>,
}

/// One submitted job: an ordered opcode list plus mutable per-opcode
/// status, guarded by a single mutex since only the job's own runner task
/// ever mutates it (readers go through `JobQueue::snapshot`).
pub struct Job {
    pub id: u64,
    pub opcodes: Vec<Opcode>,
    state: Mutex<JobState>,
}

impl Job {
    fn new(id: u64, opcodes: Vec<Opcode>) -> Self {
        let op_logs = opcodes.iter().map(|_| OpLog::default()).collect();
        Self {
            id,
            opcodes,
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                op_logs,
            }),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn op_logs(&self) -> Vec<OpLog> {
        self.state.lock().op_logs.clone()
    }
}

/// Process-wide job table. No background scheduler thread: a caller
/// (typically the RPC handler that accepted the submission) spawns
/// `run_job` itself, matching the "hand to the LU framework" contract —
/// this module owns status tracking, not execution concurrency policy.
pub struct JobQueue {
    next_id: AtomicU64,
    jobs: DashMap<u64, Arc<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: DashMap::new(),
        }
    }

    pub fn submit(&self, opcodes: Vec<Opcode>) -> Arc<Job> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(Job::new(id, opcodes));
        self.jobs.insert(id, job.clone());
        job
    }

    pub fn get(&self, id: u64) -> Option<Arc<Job>> {
        self.jobs.get(&id).map(|e| e.clone())
    }

    /// Runs every opcode in `job` in order. A `depends` entry names an
    /// index earlier in the same job's opcode list; since opcodes already
    /// run strictly in order, a dependency is satisfied iff that earlier
    /// opcode's status is `Success` by the time this one starts — anything
    /// else means the job already aborted and this opcode is skipped.
    pub async fn run_job(&self, processor: &Processor, job: &Arc<Job>) -> Result<()> {
        {
            let mut state = job.state.lock();
            state.status = JobStatus::Running;
        }

        for (idx, opcode) in job.opcodes.iter().enumerate() {
            let deps_ok = opcode.depends.iter().all(|&d| {
                job.state
                    .lock()
                    .op_logs
                    .get(d)
                    .map(|log| log.status == Some(OpStatus::Success))
                    .unwrap_or(false)
            });
            if !deps_ok {
                let mut state = job.state.lock();
                state.status = JobStatus::Cancelled;
                warn!(job = job.id, op_index = idx, "skipping opcode: unmet dependency");
                return Ok(());
            }

            {
                let mut state = job.state.lock();
                state.op_logs[idx].status = Some(OpStatus::Running);
            }

            let job_id = job.id;
            let feedback = move |msg: String| {
                info!(job = job_id, op_index = idx, "{msg}");
            };

            if opcode.dry_run {
                let mut state = job.state.lock();
                state.op_logs[idx].status = Some(OpStatus::Success);
                state.op_logs[idx].messages.push("dry_run: skipped execution".into());
                continue;
            }

            let result = processor.run_opcode(opcode, &feedback).await;
            let mut state = job.state.lock();
            match result {
                Ok(value) => {
                    state.op_logs[idx].status = Some(OpStatus::Success);
                    state.op_logs[idx].result = Some(value);
                }
                Err(e) => {
                    state.op_logs[idx].status = Some(OpStatus::Error);
                    state.op_logs[idx].error = Some(e.to_string());
                    state.status = JobStatus::Error;
                    drop(state);
                    return Err(e);
                }
            }
        }

        job.state.lock().status = JobStatus::Success;
        Ok(())
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::opcodes::OpCode;

    #[test]
    fn submit_assigns_monotonic_ids() {
        let queue = JobQueue::new();
        let j1 = queue.submit(vec![Opcode::new(OpCode::VerifyCluster)]);
        let j2 = queue.submit(vec![Opcode::new(OpCode::VerifyCluster)]);
        assert!(j2.id > j1.id);
        assert_eq!(j1.status(), JobStatus::Queued);
    }

    #[test]
    fn get_returns_submitted_job() {
        let queue = JobQueue::new();
        let job = queue.submit(vec![Opcode::new(OpCode::VerifyCluster)]);
        assert!(queue.get(job.id).is_some());
        assert!(queue.get(job.id + 100).is_none());
    }
}
