//! Controller-owned scheduling state.
//!
//! Lives for the controller process. One instance behind a single async
//! mutex; a reconcile pass holds the lock end to end, so all mutation is
//! effectively single-writer. With `threadiness = 1` this degenerates to a
//! single reconcile fibre.

use std::collections::HashMap;

use super::ledger::SlotLedger;
use super::queues::PriorityQueue;

/// Where a tracked job currently is in its lifecycle. A completed job is
/// simply forgotten: cleanup removes every trace of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Admitted; infrastructure and workers are being brought up.
    Created,
    /// Waiting for capacity.
    Queued,
    /// Launcher exists; the job is eligible for shrink/expand.
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescaleReason {
    /// Grown by the rebalancer; waiting for pods and hostfile to converge.
    Expand,
    /// Shrunk to make room for higher-priority work.
    Preemption,
}

/// A pending process-group transition. The rescale call is a pure function
/// of this record: tell the launcher to go from `from` ranks to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRescale {
    pub from: i32,
    pub to: i32,
    pub reason: RescaleReason,
}

#[derive(Debug)]
pub struct SchedulerState {
    pub ledger: SlotLedger,
    /// Desired worker count per live job.
    pub latest_replicas: HashMap<String, i32>,
    pub job_phase: HashMap<String, JobPhase>,
    /// Hostfile text last committed per job; the cluster has converged
    /// once the persisted artifact matches this.
    pub committed_hostfiles: HashMap<String, String>,
    /// Deferred expand per job, issued once workers and hostfile converge.
    pub pending_rescale: HashMap<String, PendingRescale>,
    /// Exactly the jobs with phase Running, ascending priority.
    pub running_jobs: PriorityQueue,
    /// Jobs awaiting admission, ascending priority. A job promoted by the
    /// rebalancer leaves this queue before its re-activation pass runs.
    pub queued_jobs: PriorityQueue,
}

impl SchedulerState {
    pub fn new(pool_size: i32) -> Self {
        Self {
            ledger: SlotLedger::new(pool_size),
            latest_replicas: HashMap::new(),
            job_phase: HashMap::new(),
            committed_hostfiles: HashMap::new(),
            pending_rescale: HashMap::new(),
            running_jobs: PriorityQueue::new(),
            queued_jobs: PriorityQueue::new(),
        }
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.job_phase.contains_key(key)
    }

    /// Drop every trace of a job. Called by completion cleanup.
    pub fn forget_job(&mut self, key: &str) {
        self.latest_replicas.remove(key);
        self.job_phase.remove(key);
        self.committed_hostfiles.remove(key);
        self.pending_rescale.remove(key);
        self.running_jobs.remove_by_key(key);
        self.queued_jobs.remove_by_key(key);
    }

    /// Structural invariant check used by tests: membership of the two
    /// queues must agree with the phase map, and no key may sit in both.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.ledger.free() < 0 {
            return Err("free slots went negative".to_string());
        }
        for entry in self.running_jobs.iter() {
            if self.queued_jobs.contains(&entry.key) {
                return Err(format!("{} is in both running and queued", entry.key));
            }
            if self.job_phase.get(&entry.key) != Some(&JobPhase::Running) {
                return Err(format!("{} is in running_jobs but not Running", entry.key));
            }
        }
        for entry in self.queued_jobs.iter() {
            if self.job_phase.get(&entry.key) != Some(&JobPhase::Queued) {
                return Err(format!("{} is in queued_jobs but not Queued", entry.key));
            }
        }
        for (key, phase) in &self.job_phase {
            if *phase == JobPhase::Running && !self.running_jobs.contains(key) {
                return Err(format!("{} is Running but missing from running_jobs", key));
            }
        }
        for (key, pending) in &self.pending_rescale {
            if pending.reason == RescaleReason::Expand && pending.to <= pending.from {
                return Err(format!(
                    "{} has a pending expand that does not grow ({} -> {})",
                    key, pending.from, pending.to
                ));
            }
        }
        Ok(())
    }
}
