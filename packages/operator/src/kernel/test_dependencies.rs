// Test dependencies - in-memory implementations for testing
//
// Provides an in-memory cluster, a scripted rescaler, and a spy event
// recorder that can be injected into the controller for tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::{BaseEventRecorder, BaseObjectStore, BaseRescaler, EventType};
use crate::common::{
    BatchJob, ConfigMap, MpiJob, Pod, PodPhase, Secret, Service, LABEL_JOB_NAME, LABEL_JOB_ROLE,
    ROLE_LAUNCHER, ROLE_WORKER,
};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    mpi_jobs: HashMap<Key, MpiJob>,
    pods: HashMap<Key, Pod>,
    config_maps: HashMap<Key, ConfigMap>,
    services: HashMap<Key, Service>,
    secrets: HashMap<Key, Secret>,
    batch_jobs: HashMap<Key, BatchJob>,
}

/// In-memory cluster implementing [`BaseObjectStore`].
///
/// Beyond the store trait it offers the knobs tests need to play the
/// cluster's side of the conversation: marking pods running and ready,
/// scheduling launcher pods, finishing launchers.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_mpi_job(&self, job: MpiJob) {
        let mut state = self.state.lock().unwrap();
        state
            .mpi_jobs
            .insert(key(job.namespace(), job.name()), job);
    }

    /// The stored CR, status included.
    pub fn mpi_job(&self, namespace: &str, name: &str) -> Option<MpiJob> {
        self.state
            .lock()
            .unwrap()
            .mpi_jobs
            .get(&key(namespace, name))
            .cloned()
    }

    /// Worker pods of a job, sorted by name.
    pub fn worker_pods(&self, namespace: &str, job_name: &str) -> Vec<Pod> {
        let state = self.state.lock().unwrap();
        let mut pods: Vec<_> = state
            .pods
            .values()
            .filter(|p| {
                p.metadata.namespace == namespace
                    && p.metadata.label(LABEL_JOB_NAME) == Some(job_name)
                    && p.metadata.label(LABEL_JOB_ROLE) == Some(ROLE_WORKER)
            })
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        pods
    }

    pub fn pod_count(&self, namespace: &str, job_name: &str) -> usize {
        self.worker_pods(namespace, job_name).len()
    }

    /// Flip every worker pod of the job to Running and ready, as the
    /// cluster would once the kubelet reports them up.
    pub fn make_workers_ready(&self, namespace: &str, job_name: &str) {
        let mut state = self.state.lock().unwrap();
        for pod in state.pods.values_mut() {
            if pod.metadata.namespace == namespace
                && pod.metadata.label(LABEL_JOB_NAME) == Some(job_name)
                && pod.metadata.label(LABEL_JOB_ROLE) == Some(ROLE_WORKER)
            {
                pod.phase = PodPhase::Running;
                pod.ready = true;
            }
        }
    }

    /// Schedule the launcher pod for a job's batch job, with the given IP.
    pub fn schedule_launcher_pod(&self, job: &MpiJob, ip: &str) {
        let mut metadata = crate::common::ObjectMeta::new(job.namespace(), job.launcher_name());
        metadata
            .labels
            .insert(LABEL_JOB_NAME.to_string(), job.name().to_string());
        metadata
            .labels
            .insert(LABEL_JOB_ROLE.to_string(), ROLE_LAUNCHER.to_string());
        let pod = Pod {
            metadata,
            image: job.spec.launcher.template.image.clone(),
            command: Vec::new(),
            ip: Some(ip.to_string()),
            phase: PodPhase::Running,
            ready: true,
            env: Default::default(),
        };
        let mut state = self.state.lock().unwrap();
        state
            .pods
            .insert(key(job.namespace(), &pod.metadata.name), pod);
    }

    /// Record a terminal state on the launcher's batch job.
    pub fn finish_launcher(&self, namespace: &str, launcher_name: &str, succeeded: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(batch_job) = state.batch_jobs.get_mut(&key(namespace, launcher_name)) {
            batch_job.active = 0;
            if succeeded {
                batch_job.succeeded = 1;
            } else {
                batch_job.failed = 1;
            }
            batch_job.completion_time = Some(Utc::now());
        }
        // The launcher pod terminates with its job.
        if let Some(pod) = state.pods.get_mut(&key(namespace, launcher_name)) {
            pod.phase = if succeeded {
                PodPhase::Succeeded
            } else {
                PodPhase::Failed
            };
            pod.ready = false;
        }
    }

    pub fn batch_job(&self, namespace: &str, name: &str) -> Option<BatchJob> {
        self.state
            .lock()
            .unwrap()
            .batch_jobs
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
    }

    /// Insert a config map as-is, bypassing ownership wiring. Used to
    /// simulate a foreign object squatting on the expected name.
    pub fn put_config_map(&self, config_map: ConfigMap) {
        let mut state = self.state.lock().unwrap();
        state.config_maps.insert(
            key(&config_map.metadata.namespace, &config_map.metadata.name),
            config_map,
        );
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&key(namespace, name))
            .cloned()
    }
}

#[async_trait]
impl BaseObjectStore for MockCluster {
    async fn get_mpi_job(&self, namespace: &str, name: &str) -> Result<Option<MpiJob>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .mpi_jobs
            .get(&key(namespace, name))
            .cloned())
    }

    async fn update_mpi_job_status(&self, job: &MpiJob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.mpi_jobs.get_mut(&key(job.namespace(), job.name())) {
            Some(stored) => {
                stored.status = job.status.clone();
                Ok(())
            }
            None => bail!("mpi job {} not found", job.key()),
        }
    }

    async fn list_worker_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>> {
        Ok(self.worker_pods(namespace, job_name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_pod(&self, pod: Pod) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let pod_key = key(&pod.metadata.namespace, &pod.metadata.name);
        if state.pods.contains_key(&pod_key) {
            bail!("pod {} already exists", pod.metadata.name);
        }
        state.pods.insert(pod_key, pod);
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .remove(&key(namespace, name))
            .is_some())
    }

    async fn get_launcher_pod(&self, namespace: &str, job_name: &str) -> Result<Option<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .values()
            .find(|p| {
                p.metadata.namespace == namespace
                    && p.metadata.label(LABEL_JOB_NAME) == Some(job_name)
                    && p.metadata.label(LABEL_JOB_ROLE) == Some(ROLE_LAUNCHER)
            })
            .cloned())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_config_map(&self, config_map: ConfigMap) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let map_key = key(&config_map.metadata.namespace, &config_map.metadata.name);
        if state.config_maps.contains_key(&map_key) {
            bail!("config map {} already exists", config_map.metadata.name);
        }
        state.config_maps.insert(map_key, config_map);
        Ok(())
    }

    async fn update_config_map(&self, config_map: ConfigMap) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let map_key = key(&config_map.metadata.namespace, &config_map.metadata.name);
        match state.config_maps.get_mut(&map_key) {
            Some(stored) => {
                stored.data = config_map.data;
                Ok(())
            }
            None => bail!("config map {} not found", config_map.metadata.name),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_service(&self, service: Service) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let service_key = key(&service.metadata.namespace, &service.metadata.name);
        if state.services.contains_key(&service_key) {
            bail!("service {} already exists", service.metadata.name);
        }
        state.services.insert(service_key, service);
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_secret(&self, secret: Secret) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let secret_key = key(&secret.metadata.namespace, &secret.metadata.name);
        if state.secrets.contains_key(&secret_key) {
            bail!("secret {} already exists", secret.metadata.name);
        }
        state.secrets.insert(secret_key, secret);
        Ok(())
    }

    async fn get_batch_job(&self, namespace: &str, name: &str) -> Result<Option<BatchJob>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .batch_jobs
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_batch_job(&self, job: BatchJob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job_key = key(&job.metadata.namespace, &job.metadata.name);
        if state.batch_jobs.contains_key(&job_key) {
            bail!("batch job {} already exists", job.metadata.name);
        }
        state.batch_jobs.insert(job_key, job);
        Ok(())
    }

    async fn update_batch_job(&self, job: BatchJob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job_key = key(&job.metadata.namespace, &job.metadata.name);
        match state.batch_jobs.get_mut(&job_key) {
            Some(stored) => {
                *stored = job;
                Ok(())
            }
            None => bail!("batch job {} not found", job.metadata.name),
        }
    }
}

// =============================================================================
// Scripted Rescaler (for testing)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescaleCall {
    pub host: String,
    pub port: u16,
    pub old_procs: i32,
    pub new_procs: i32,
}

/// Rescaler that records every call and answers from a scripted queue of
/// verdicts. An empty script means every call succeeds.
#[derive(Default)]
pub struct ScriptedRescaler {
    verdicts: Mutex<Vec<bool>>,
    calls: Mutex<Vec<RescaleCall>>,
}

impl ScriptedRescaler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a verdict for the next unanswered call.
    pub fn push_verdict(&self, ok: bool) {
        self.verdicts.lock().unwrap().push(ok);
    }

    pub fn calls(&self) -> Vec<RescaleCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BaseRescaler for ScriptedRescaler {
    async fn rescale(&self, host: &str, port: u16, old_procs: i32, new_procs: i32) -> Result<()> {
        if old_procs == new_procs {
            return Ok(());
        }
        self.calls.lock().unwrap().push(RescaleCall {
            host: host.to_string(),
            port,
            old_procs,
            new_procs,
        });
        let verdict = {
            let mut verdicts = self.verdicts.lock().unwrap();
            if verdicts.is_empty() {
                true
            } else {
                verdicts.remove(0)
            }
        };
        if !verdict {
            bail!("scripted rescale failure");
        }
        Ok(())
    }
}

// =============================================================================
// Spy Event Recorder (for testing)
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub job_key: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Event recorder that remembers everything it was told.
#[derive(Default)]
pub struct SpyEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl SpyEventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.reason == reason)
    }
}

impl BaseEventRecorder for SpyEventRecorder {
    fn event(&self, job: &MpiJob, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            job_key: job.key(),
            event_type,
            reason: reason.to_string(),
            message: super::traits::truncate_event_message(message).to_string(),
        });
    }
}
