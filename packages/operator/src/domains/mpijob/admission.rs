//! Admission and rebalancing.
//!
//! `admit` decides what a newly-seen job gets: a worker count, or a place
//! in the queue. When the free pool cannot cover the job's minimum it
//! tries to shrink strictly lower-priority running jobs - dry run first,
//! and only if the dry run covers the shortfall does the commit pass issue
//! any rescale.
//!
//! `rebalance` runs on every completion and promotion: it walks the
//! running and queued jobs together in ascending priority order and hands
//! out the freed capacity. It plans against a snapshot of the free count;
//! the ledger itself only moves when pods are actually created or deleted.

use tracing::{debug, info, warn};

use crate::common::{split_key, MpiJob};

use super::controller::MpiJobController;
use super::error::ReconcileError;
use super::state::{PendingRescale, RescaleReason, SchedulerState};

/// Outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admit with this many workers.
    Admit(i32),
    /// Cannot fit, even after preemption. Not an error.
    Queue,
}

struct Victim {
    key: String,
    job: MpiJob,
    current: i32,
    shed: i32,
}

impl MpiJobController {
    /// Decide admission for a job that is not currently tracked.
    ///
    /// One slot is always kept back for the launcher, so the best grant is
    /// `min(free - 1, max_replicas)`.
    pub(crate) async fn admit(
        &self,
        state: &mut SchedulerState,
        job: &MpiJob,
    ) -> Result<Admission, ReconcileError> {
        let min = job.spec.worker.min_replicas;
        let max = job.spec.worker.max_replicas;

        let capped = (state.ledger.free() - 1).min(max);
        if capped >= min {
            return Ok(Admission::Admit(capped));
        }

        // Dry run: walk running jobs from the lowest scheduling priority
        // and count what they could shed without dipping below their own
        // minimum. Jobs at or above the new job's priority are untouchable.
        let mut need = min - (state.ledger.free() - 1);
        let mut victims: Vec<Victim> = Vec::new();
        for entry in state.running_jobs.iter().rev() {
            if need <= 0 {
                break;
            }
            if entry.priority <= job.priority() {
                break;
            }
            let Some((namespace, name)) = split_key(&entry.key) else {
                continue;
            };
            let Some(victim_cr) = self.store.get_mpi_job(namespace, name).await? else {
                continue;
            };
            let current = state.latest_replicas.get(&entry.key).copied().unwrap_or(0);
            let sheddable = current - victim_cr.spec.worker.min_replicas;
            if sheddable <= 0 {
                continue;
            }
            let shed = sheddable.min(need);
            need -= shed;
            victims.push(Victim {
                key: entry.key.clone(),
                job: victim_cr,
                current,
                shed,
            });
        }
        if need > 0 {
            debug!(job = %job.key(), shortfall = need, "cannot admit even with preemption");
            return Ok(Admission::Queue);
        }

        // Commit pass: actually shrink the chosen victims. A failed rescale
        // leaves that victim's replica count and pods untouched.
        let mut need = min - (state.ledger.free() - 1);
        for victim in victims {
            if need <= 0 {
                break;
            }
            let shed = victim.shed.min(need);
            let target = victim.current - shed;
            let pending = PendingRescale {
                from: victim.current,
                to: target,
                reason: RescaleReason::Preemption,
            };
            if let Err(e) = self.issue_rescale(&victim.job, &pending).await {
                warn!(victim = %victim.key, error = %e, "preemption rescale failed, skipping victim");
                continue;
            }

            state.latest_replicas.insert(victim.key.clone(), target);
            // The launcher now runs the shrunk group; any deferred expand
            // recorded against the old group is stale.
            state.pending_rescale.remove(&victim.key);
            // Drop the shed pods right away so the slots are actually free
            // for the incoming job.
            for index in target..victim.current {
                if self
                    .store
                    .delete_pod(victim.job.namespace(), &victim.job.worker_pod_name(index))
                    .await?
                {
                    state.ledger.release(1);
                }
            }
            self.queue.add(&victim.key);
            info!(
                victim = %victim.key,
                from = victim.current,
                to = target,
                preempted_by = %job.key(),
                "shrank running job"
            );
            need -= shed;
        }

        if need > 0 {
            return Ok(Admission::Queue);
        }
        Ok(Admission::Admit(min))
    }

    /// Hand freed capacity to the most deserving jobs: walk the running
    /// and queued collections together in ascending priority order,
    /// expanding running jobs toward their maximum and promoting queued
    /// jobs that fit.
    pub(crate) async fn rebalance(
        &self,
        state: &mut SchedulerState,
    ) -> Result<(), ReconcileError> {
        // Planning snapshot; the ledger moves on real create/delete.
        let mut free = state.ledger.free();
        let mut running_cursor = 0usize;
        let mut queued_cursor = 0usize;

        while free > 0 {
            let running_head = state.running_jobs.head(running_cursor).cloned();
            let queued_head = state.queued_jobs.head(queued_cursor).cloned();
            let take_running = match (&running_head, &queued_head) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(r), Some(q)) => r.priority <= q.priority,
            };

            if take_running {
                let entry = running_head.expect("running head checked above");
                running_cursor += 1;
                let Some((namespace, name)) = split_key(&entry.key) else {
                    continue;
                };
                let Some(cr) = self.store.get_mpi_job(namespace, name).await? else {
                    continue;
                };
                let current = state.latest_replicas.get(&entry.key).copied().unwrap_or(0);
                let growth = (cr.spec.worker.max_replicas - current).min(free);
                if growth > 0 {
                    state
                        .latest_replicas
                        .insert(entry.key.clone(), current + growth);
                    free -= growth;
                    self.queue.add(&entry.key);
                    info!(job = %entry.key, from = current, to = current + growth, "expanding running job");
                }
            } else {
                let entry = queued_head.expect("queued head checked above");
                let Some((namespace, name)) = split_key(&entry.key) else {
                    queued_cursor += 1;
                    continue;
                };
                let Some(cr) = self.store.get_mpi_job(namespace, name).await? else {
                    // CR vanished while queued; drop every trace. The
                    // removal shifts the remaining entries down, so the
                    // cursor stays put.
                    state.forget_job(&entry.key);
                    continue;
                };
                // The promotion must also cover the launcher slot.
                let grant = (free - 1).min(cr.spec.worker.max_replicas);
                if grant >= cr.spec.worker.min_replicas {
                    state.latest_replicas.insert(entry.key.clone(), grant);
                    state.queued_jobs.remove_by_key(&entry.key);
                    free -= grant + 1;
                    self.queue.add(&entry.key);
                    info!(job = %entry.key, replicas = grant, "promoting queued job");
                } else {
                    queued_cursor += 1;
                }
            }
        }
        Ok(())
    }

    /// Cheap variant run when a launcher comes up: re-try admission for
    /// every queued job and enqueue the ones that now fit.
    pub(crate) async fn recheck_queue(
        &self,
        state: &mut SchedulerState,
    ) -> Result<(), ReconcileError> {
        for key in state.queued_jobs.keys() {
            let Some((namespace, name)) = split_key(&key) else {
                continue;
            };
            let Some(cr) = self.store.get_mpi_job(namespace, name).await? else {
                state.forget_job(&key);
                continue;
            };
            if let Admission::Admit(replicas) = self.admit(state, &cr).await? {
                state.latest_replicas.insert(key.clone(), replicas);
                state.queued_jobs.remove_by_key(&key);
                self.queue.add(&key);
                info!(job = %key, replicas, "queued job now fits");
            }
        }
        Ok(())
    }
}
