//! The job state machine: one reconcile pass per work-queue key.
//!
//! A pass observes the CR, admits or re-activates the job, converges the
//! worker-pod population and the hostfile toward the desired replica
//! count, and - once everything has settled - either creates the launcher
//! or issues the deferred expand rescale. Completion tears everything
//! down and hands the freed slots to the rebalancer.
//!
//! The hostfile is always committed *before* a rescale is issued, so a
//! launcher re-reading its nodelist sees the new member set.
//!
//! The whole pass runs under the scheduler-state mutex: reconciles of
//! different keys serialize on it, and the work queue already guarantees
//! at most one in-flight pass per key.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{
    split_key, BatchJob, CleanPodPolicy, JobConditionType, MpiJob, Pod, PodPhase, ReplicaStatus,
    REPLICA_LAUNCHER, REPLICA_WORKER,
};
use crate::config::Config;
use crate::kernel::{
    BaseEventRecorder, BaseObjectStore, BaseReconciler, BaseRescaler, EventType, WorkQueue,
};

use super::error::ReconcileError;
use super::state::{JobPhase, PendingRescale, RescaleReason, SchedulerState};
use super::{events, hostfile, templates, validation};

pub struct MpiJobController {
    pub(crate) store: Arc<dyn BaseObjectStore>,
    pub(crate) rescaler: Arc<dyn BaseRescaler>,
    pub(crate) recorder: Arc<dyn BaseEventRecorder>,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) config: Config,
    state: Mutex<SchedulerState>,
}

impl MpiJobController {
    pub fn new(
        config: Config,
        store: Arc<dyn BaseObjectStore>,
        rescaler: Arc<dyn BaseRescaler>,
        recorder: Arc<dyn BaseEventRecorder>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        let state = SchedulerState::new(config.pool_size);
        Self {
            store,
            rescaler,
            recorder,
            queue,
            config,
            state: Mutex::new(state),
        }
    }

    /// The scheduler state, for inspection. Callers must not hold the
    /// guard across a reconcile.
    pub async fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().await
    }

    /// Re-run the rebalancer outside the completion path, e.g. when
    /// capacity changes for reasons the reconcile loop cannot see.
    pub async fn rebalance_now(&self) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;
        self.rebalance(&mut state).await
    }

    /// One pass of the state machine over a single job key.
    pub async fn reconcile_key(
        &self,
        raw_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let Some((namespace, name)) = split_key(raw_key) else {
            warn!(key = raw_key, "ignoring malformed key");
            return Ok(());
        };

        let mut state = self.state.lock().await;

        // Observe.
        let Some(mut job) = self.store.get_mpi_job(namespace, name).await? else {
            debug!(job = raw_key, "resource gone");
            return Ok(());
        };
        if job.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        // Validate. Failures are surfaced once and not requeued.
        if let Err(message) = validation::validate(&job) {
            self.recorder
                .event(&job, EventType::Warning, events::VALIDATION_ERROR, &message);
            return Ok(());
        }

        let key = job.key();

        // First sight: decide admission.
        if !state.is_tracked(&key) {
            if job.status.completion_time.is_some() {
                // Finished and already cleaned up.
                return Ok(());
            }
            match self.admit(&mut state, &job).await? {
                super::admission::Admission::Queue => {
                    state.job_phase.insert(key.clone(), JobPhase::Queued);
                    state.queued_jobs.insert(&key, job.priority());
                    job.status.set_condition(
                        JobConditionType::Created,
                        events::MPI_JOB_CREATED,
                        "queued awaiting capacity",
                    );
                    self.recorder.event(
                        &job,
                        EventType::Normal,
                        events::MPI_JOB_CREATED,
                        "insufficient capacity, job queued",
                    );
                    self.store.update_mpi_job_status(&job).await?;
                    return Ok(());
                }
                super::admission::Admission::Admit(replicas) => {
                    state.latest_replicas.insert(key.clone(), replicas);
                    state.job_phase.insert(key.clone(), JobPhase::Created);
                    // The launcher's slot is claimed at admission.
                    state
                        .ledger
                        .reserve(1)
                        .map_err(|e| ReconcileError::transient(e.to_string()))?;
                    let message = format!("admitted with {} workers", replicas);
                    job.status.set_condition(
                        JobConditionType::Created,
                        events::MPI_JOB_CREATED,
                        message.as_str(),
                    );
                    self.recorder
                        .event(&job, EventType::Normal, events::MPI_JOB_CREATED, &message);
                    self.store.update_mpi_job_status(&job).await?;
                }
            }
        }

        // Re-activation: the rebalancer granted a queued job capacity and
        // enqueued its key.
        if state.job_phase.get(&key) == Some(&JobPhase::Queued) {
            let granted = state.latest_replicas.get(&key).copied().unwrap_or(0);
            if granted == 0 {
                return Ok(());
            }
            if state.ledger.reserve(1).is_err() {
                // The promised capacity evaporated under a concurrent
                // admission; wait for the next rebalance.
                debug!(job = %key, "promotion raced out of capacity, staying queued");
                return Ok(());
            }
            state.job_phase.insert(key.clone(), JobPhase::Created);
            state.queued_jobs.remove_by_key(&key);
        }

        // Suspension tears the workers down and parks the job.
        if job.is_suspended() {
            self.reconcile_suspension(&mut state, &mut job).await?;
            return Ok(());
        }

        // Infrastructure: service and SSH auth.
        self.ensure_service(&job).await?;
        self.ensure_ssh_secret(&job).await?;

        // Workers.
        let desired = state.latest_replicas.get(&key).copied().unwrap_or(0);
        self.reconcile_workers(&mut state, &job, desired).await?;
        if state.job_phase.get(&key) == Some(&JobPhase::Queued) {
            // Demoted: not enough slots to bring the job up.
            return Ok(());
        }

        // Hostfile. Committed before any rescale can fire.
        let pods = self.store.list_worker_pods(namespace, name).await?;
        let rendered = hostfile::render_hostfile(&job, desired);
        let discover = hostfile::render_discover_hosts(&job, &pods);
        if let Err(e) =
            hostfile::reconcile_config_map(self.store.as_ref(), &job, &rendered, &discover).await
        {
            if let ReconcileError::ResourceExists { kind, ref name } = e {
                self.recorder.event(
                    &job,
                    EventType::Warning,
                    events::ERR_RESOURCE_EXISTS,
                    &format!("{} {} exists and is not owned by this job", kind, name),
                );
            }
            return Err(e);
        }
        state.committed_hostfiles.insert(key.clone(), rendered.clone());

        // Expand detection: a running job with fewer live pods than
        // desired has a rescale ahead of it. Keep the originally observed
        // count if a transition is already pending - the launcher still
        // runs that group.
        let running_count = pods.iter().filter(|p| p.is_running()).count() as i32;
        if state.job_phase.get(&key) == Some(&JobPhase::Running)
            && running_count > 0
            && running_count < desired
        {
            match state.pending_rescale.get_mut(&key) {
                Some(pending) => pending.to = desired,
                None => {
                    state.pending_rescale.insert(
                        key.clone(),
                        PendingRescale {
                            from: running_count,
                            to: desired,
                            reason: RescaleReason::Expand,
                        },
                    );
                }
            }
        }

        // Convergence: all workers ready and the persisted hostfile
        // matches what this controller committed.
        let ready_count = pods
            .iter()
            .filter(|p| p.is_running() && p.ready)
            .count() as i32;
        let persisted_hostfile = self
            .store
            .get_config_map(namespace, &job.config_map_name())
            .await?
            .and_then(|cm| cm.data.get(hostfile::HOSTFILE_KEY).cloned());
        let converged =
            ready_count == desired && persisted_hostfile.as_deref() == Some(rendered.as_str());

        if converged {
            if let Some(pending) = state.pending_rescale.get(&key).copied() {
                // Give fresh pods a moment for DNS and sshd to settle.
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ReconcileError::transient("shut down during expand grace"));
                    }
                    _ = tokio::time::sleep(self.config.expand_grace) => {}
                }
                self.issue_rescale(&job, &pending).await?;
                state.pending_rescale.remove(&key);
                info!(job = %key, from = pending.from, to = pending.to, "process group rescaled");
            } else if self
                .store
                .get_batch_job(namespace, &job.launcher_name())
                .await?
                .is_none()
            {
                let launcher =
                    templates::new_launcher_job(&job, desired, self.config.rescale_port);
                self.store.create_batch_job(launcher).await?;
                state.job_phase.insert(key.clone(), JobPhase::Running);
                state.running_jobs.insert(&key, job.priority());
                state.queued_jobs.remove_by_key(&key);
                job.status.start_time = Some(Utc::now());
                self.store.update_mpi_job_status(&job).await?;
                info!(job = %key, workers = desired, "launcher created");
            }
        }

        // Launcher observation.
        if let Some(launcher) = self
            .store
            .get_batch_job(namespace, &job.launcher_name())
            .await?
        {
            if !launcher.metadata.is_owned_by(job.metadata.uid) {
                let launcher_name = job.launcher_name();
                self.recorder.event(
                    &job,
                    EventType::Warning,
                    events::ERR_RESOURCE_EXISTS,
                    &format!(
                        "batch job {} exists and is not owned by this job",
                        launcher_name
                    ),
                );
                return Err(ReconcileError::ResourceExists {
                    kind: "batch job",
                    name: launcher_name,
                });
            }

            let launcher_pod = self.store.get_launcher_pod(namespace, name).await?;
            let launcher_running = launcher_pod
                .as_ref()
                .map(|p| p.is_running())
                .unwrap_or(false);

            if launcher_running {
                if state.job_phase.get(&key) != Some(&JobPhase::Running) {
                    state.job_phase.insert(key.clone(), JobPhase::Running);
                    state.queued_jobs.remove_by_key(&key);
                }
                state.running_jobs.insert(&key, job.priority());
                if !job.status.has_condition(JobConditionType::Running) {
                    job.status.set_condition(
                        JobConditionType::Running,
                        events::MPI_JOB_RUNNING,
                        "launcher pod is running",
                    );
                    self.recorder.event(
                        &job,
                        EventType::Normal,
                        events::MPI_JOB_RUNNING,
                        "launcher pod is running",
                    );
                    self.store.update_mpi_job_status(&job).await?;
                }
                // Capacity may have shifted since the queue last moved.
                self.recheck_queue(&mut state).await?;
            }

            // Resume: the CR is no longer suspended but the launcher (or
            // the recorded condition) still is.
            if !job.is_suspended()
                && (launcher.suspend || job.status.has_condition(JobConditionType::Suspended))
            {
                if launcher.suspend {
                    let mut updated = launcher.clone();
                    updated.suspend = false;
                    self.store.update_batch_job(updated).await?;
                }
                job.status
                    .clear_condition(JobConditionType::Suspended, events::MPI_JOB_RESUMED);
                job.status.start_time = Some(Utc::now());
                self.recorder.event(
                    &job,
                    EventType::Normal,
                    events::MPI_JOB_RESUMED,
                    "job resumed",
                );
                self.store.update_mpi_job_status(&job).await?;
            }

            // Completion: tear down once, then hand the slots out again.
            if launcher.is_finished() && state.is_tracked(&key) {
                self.cleanup(&mut state, &mut job, &launcher).await?;
                self.rebalance(&mut state).await?;
                return Ok(());
            }

            self.sync_replica_statuses(&mut job, &pods, &launcher, launcher_pod.as_ref())
                .await?;
        }

        Ok(())
    }

    /// Converge worker pods toward the desired count: delete pods indexed
    /// at or above it, create the missing ones below it.
    async fn reconcile_workers(
        &self,
        state: &mut SchedulerState,
        job: &MpiJob,
        desired: i32,
    ) -> Result<(), ReconcileError> {
        let key = job.key();
        let pods = self
            .store
            .list_worker_pods(job.namespace(), job.name())
            .await?;

        // Shrink path.
        for pod in &pods {
            let Some(index) = templates::worker_index(job, &pod.metadata.name) else {
                continue;
            };
            if index >= desired {
                if self
                    .store
                    .delete_pod(&pod.metadata.namespace, &pod.metadata.name)
                    .await?
                {
                    state.ledger.release(1);
                }
            }
        }

        // Create missing indices.
        let existing: HashSet<i32> = pods
            .iter()
            .filter_map(|p| templates::worker_index(job, &p.metadata.name))
            .filter(|index| *index < desired)
            .collect();
        let missing: Vec<i32> = (0..desired).filter(|i| !existing.contains(i)).collect();
        if missing.is_empty() {
            return Ok(());
        }

        let free = state.ledger.free();
        let needed = missing.len() as i32;
        let mut shortfall = false;
        let create_list: &[i32] = if needed <= free {
            &missing
        } else if state.job_phase.get(&key) == Some(&JobPhase::Running) {
            // Over-promised expansion: create what fits, retry the rest.
            // A running job is never demoted back to the queue.
            shortfall = true;
            &missing[..free.max(0) as usize]
        } else {
            // Cannot bring the job up; give back the launcher slot and
            // park it until the rebalancer finds room. Capacity only
            // reappears through completion or preemption, and both
            // re-enqueue promoted jobs.
            state.ledger.release(1);
            state.job_phase.insert(key.clone(), JobPhase::Queued);
            state.queued_jobs.insert(&key, job.priority());
            debug!(job = %key, needed, free, "insufficient slots, job queued");
            return Ok(());
        };

        for &index in create_list {
            let pod = templates::new_worker_pod(job, index);
            // Reserve only after the create succeeded: a failed create
            // must not move the ledger.
            self.store.create_pod(pod).await?;
            state
                .ledger
                .reserve(1)
                .map_err(|e| ReconcileError::transient(e.to_string()))?;
        }

        if shortfall {
            return Err(ReconcileError::transient(
                "not enough free slots to complete expansion",
            ));
        }
        Ok(())
    }

    /// Suspension: align the launcher's suspend flag and tear down the
    /// workers, releasing their slots. The launcher slot stays claimed.
    async fn reconcile_suspension(
        &self,
        state: &mut SchedulerState,
        job: &mut MpiJob,
    ) -> Result<(), ReconcileError> {
        if let Some(launcher) = self
            .store
            .get_batch_job(job.namespace(), &job.launcher_name())
            .await?
        {
            if !launcher.suspend {
                let mut updated = launcher;
                updated.suspend = true;
                self.store.update_batch_job(updated).await?;
            }
        }

        let pods = self
            .store
            .list_worker_pods(job.namespace(), job.name())
            .await?;
        for pod in pods {
            if self
                .store
                .delete_pod(&pod.metadata.namespace, &pod.metadata.name)
                .await?
            {
                state.ledger.release(1);
            }
        }

        if !job.status.has_condition(JobConditionType::Suspended) {
            job.status.set_condition(
                JobConditionType::Suspended,
                events::MPI_JOB_SUSPENDED,
                "job suspended",
            );
            self.recorder.event(
                job,
                EventType::Normal,
                events::MPI_JOB_SUSPENDED,
                "job suspended, worker pods deleted",
            );
            self.store.update_mpi_job_status(job).await?;
        }
        Ok(())
    }

    /// Completion cleanup: delete workers per the clean-pod policy
    /// (releasing a slot per actual deletion), give back the launcher
    /// slot, and forget the job.
    async fn cleanup(
        &self,
        state: &mut SchedulerState,
        job: &mut MpiJob,
        launcher: &BatchJob,
    ) -> Result<(), ReconcileError> {
        let key = job.key();
        let policy = job.clean_pod_policy(self.config.default_clean_pod_policy);
        let pods = self
            .store
            .list_worker_pods(job.namespace(), job.name())
            .await?;
        for pod in &pods {
            let delete = match policy {
                CleanPodPolicy::All => true,
                CleanPodPolicy::Running => {
                    !matches!(pod.phase, PodPhase::Succeeded | PodPhase::Failed)
                }
                CleanPodPolicy::None => false,
            };
            if delete
                && self
                    .store
                    .delete_pod(&pod.metadata.namespace, &pod.metadata.name)
                    .await?
            {
                state.ledger.release(1);
            }
        }
        state.ledger.release(1);
        state.forget_job(&key);

        job.status.completion_time = launcher.completion_time;
        if launcher.has_succeeded() {
            job.status.set_condition(
                JobConditionType::Succeeded,
                events::MPI_JOB_SUCCEEDED,
                "launcher completed successfully",
            );
            self.recorder.event(
                job,
                EventType::Normal,
                events::MPI_JOB_SUCCEEDED,
                "job completed successfully",
            );
        } else {
            job.status.set_condition(
                JobConditionType::Failed,
                events::MPI_JOB_FAILED,
                "launcher failed",
            );
            self.recorder
                .event(job, EventType::Warning, events::MPI_JOB_FAILED, "job failed");
        }
        self.store.update_mpi_job_status(job).await?;
        info!(job = %key, free = state.ledger.free(), "job completed, slots released");
        Ok(())
    }

    /// Issue the rescale described by a pending-transition record against
    /// the job's launcher. Pure function of the record: the launcher goes
    /// from `from` ranks to `to`.
    pub(crate) async fn issue_rescale(
        &self,
        job: &MpiJob,
        pending: &PendingRescale,
    ) -> Result<(), ReconcileError> {
        if pending.from == pending.to {
            return Ok(());
        }
        let launcher_pod = self
            .store
            .get_launcher_pod(job.namespace(), job.name())
            .await?
            .ok_or_else(|| ReconcileError::transient("launcher pod not found for rescale"))?;
        let ip = launcher_pod
            .ip
            .ok_or_else(|| ReconcileError::transient("launcher pod has no IP yet"))?;
        self.rescaler
            .rescale(&ip, self.config.rescale_port, pending.from, pending.to)
            .await
            .map_err(ReconcileError::Rescale)
    }

    async fn ensure_service(&self, job: &MpiJob) -> Result<(), ReconcileError> {
        let name = job.service_name();
        match self.store.get_service(job.namespace(), &name).await? {
            None => {
                self.store.create_service(templates::new_service(job)).await?;
            }
            Some(existing) if !existing.metadata.is_owned_by(job.metadata.uid) => {
                self.recorder.event(
                    job,
                    EventType::Warning,
                    events::ERR_RESOURCE_EXISTS,
                    &format!("service {} exists and is not owned by this job", name),
                );
                return Err(ReconcileError::ResourceExists {
                    kind: "service",
                    name,
                });
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn ensure_ssh_secret(&self, job: &MpiJob) -> Result<(), ReconcileError> {
        let name = job.secret_name();
        match self.store.get_secret(job.namespace(), &name).await? {
            None => {
                self.store
                    .create_secret(templates::new_ssh_auth_secret(job))
                    .await?;
            }
            Some(existing) if !existing.metadata.is_owned_by(job.metadata.uid) => {
                self.recorder.event(
                    job,
                    EventType::Warning,
                    events::ERR_RESOURCE_EXISTS,
                    &format!("secret {} exists and is not owned by this job", name),
                );
                return Err(ReconcileError::ResourceExists {
                    kind: "secret",
                    name,
                });
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Refresh the per-role pod counts in the status subresource, writing
    /// only when something changed.
    async fn sync_replica_statuses(
        &self,
        job: &mut MpiJob,
        worker_pods: &[Pod],
        launcher: &BatchJob,
        launcher_pod: Option<&Pod>,
    ) -> Result<(), ReconcileError> {
        let mut workers = ReplicaStatus::default();
        for pod in worker_pods {
            match pod.phase {
                PodPhase::Running | PodPhase::Pending => workers.active += 1,
                PodPhase::Succeeded => workers.succeeded += 1,
                PodPhase::Failed => workers.failed += 1,
            }
        }
        let launcher_status = ReplicaStatus {
            active: launcher_pod.map(|p| p.is_running() as i32).unwrap_or(0),
            succeeded: launcher.succeeded,
            failed: launcher.failed,
        };

        let mut statuses = HashMap::new();
        statuses.insert(REPLICA_WORKER.to_string(), workers);
        statuses.insert(REPLICA_LAUNCHER.to_string(), launcher_status);

        if job.status.replica_statuses != statuses {
            job.status.replica_statuses = statuses;
            self.store.update_mpi_job_status(job).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BaseReconciler for MpiJobController {
    async fn reconcile(&self, key: &str, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.reconcile_key(key, cancel)
            .await
            .map_err(anyhow::Error::from)
    }
}
