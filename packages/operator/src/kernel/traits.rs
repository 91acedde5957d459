// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no scheduling logic.
// Scheduling decisions (admission, rebalancing, rescaling policy) are
// domain functions that use these traits.
//
// Naming convention: Base* for trait names (e.g., BaseObjectStore)

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::common::{BatchJob, ConfigMap, MpiJob, Pod, Secret, Service};

// =============================================================================
// Object Store Trait (Infrastructure - cluster reads and writes)
// =============================================================================

/// The controller's view of the cluster. Reads are eventually consistent;
/// writes are authoritative. Every child object created through this trait
/// must already carry its owner reference.
#[async_trait]
pub trait BaseObjectStore: Send + Sync {
    // MPIJob custom resource
    async fn get_mpi_job(&self, namespace: &str, name: &str) -> Result<Option<MpiJob>>;

    /// Write the status subresource. The spec of the stored CR is left
    /// untouched.
    async fn update_mpi_job_status(&self, job: &MpiJob) -> Result<()>;

    // Pods
    /// Worker pods of the given job, in no particular order.
    async fn list_worker_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<Pod>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    /// Fails if a pod of the same name already exists.
    async fn create_pod(&self, pod: Pod) -> Result<()>;
    /// Returns whether the pod existed.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool>;
    /// The launcher pod of the given job, if the cluster has scheduled one.
    async fn get_launcher_pod(&self, namespace: &str, job_name: &str) -> Result<Option<Pod>>;

    // Config artifact
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, config_map: ConfigMap) -> Result<()>;
    async fn update_config_map(&self, config_map: ConfigMap) -> Result<()>;

    // Service and SSH auth
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, service: Service) -> Result<()>;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, secret: Secret) -> Result<()>;

    // Launcher batch job
    async fn get_batch_job(&self, namespace: &str, name: &str) -> Result<Option<BatchJob>>;
    async fn create_batch_job(&self, job: BatchJob) -> Result<()>;
    async fn update_batch_job(&self, job: BatchJob) -> Result<()>;
}

// =============================================================================
// Rescale Trait (Infrastructure - out-of-band launcher RPC)
// =============================================================================

/// Tells a running launcher to expand or shrink its process group in place.
///
/// The call is synchronous and blocking from the controller's perspective.
/// A failure must leave all controller-owned accounting untouched; the
/// caller decides whether to abort the pod-count change.
#[async_trait]
pub trait BaseRescaler: Send + Sync {
    async fn rescale(&self, host: &str, port: u16, old_procs: i32, new_procs: i32) -> Result<()>;
}

// =============================================================================
// Event Recorder Trait (Infrastructure - user-visible job events)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Cap on a single event message. Longer messages are truncated by the
/// recorder implementations.
pub const MAX_EVENT_MESSAGE_BYTES: usize = 1024;

/// Truncate an event message to [`MAX_EVENT_MESSAGE_BYTES`], respecting
/// char boundaries.
pub fn truncate_event_message(message: &str) -> &str {
    if message.len() <= MAX_EVENT_MESSAGE_BYTES {
        return message;
    }
    let mut end = MAX_EVENT_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

pub trait BaseEventRecorder: Send + Sync {
    /// Record an event against the given job.
    fn event(&self, job: &MpiJob, event_type: EventType, reason: &str, message: &str);
}

// =============================================================================
// Reconciler Trait (Infrastructure - dispatcher target)
// =============================================================================

/// One pass of a state machine over a single job key. The dispatcher
/// forgets the key on `Ok` and requeues it with backoff on `Err`.
#[async_trait]
pub trait BaseReconciler: Send + Sync {
    async fn reconcile(&self, key: &str, cancel: &CancellationToken) -> Result<()>;
}
