// Cluster resource model
//
// Typed views of the objects the controller owns or observes. Only the
// fields the scheduling core actually consumes are modeled; everything
// else stays with the cluster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Label carrying the owning MPI job's name on every child object.
pub const LABEL_JOB_NAME: &str = "mpi-job-name";
/// Label distinguishing worker pods from the launcher pod.
pub const LABEL_JOB_ROLE: &str = "mpi-job-role";
pub const ROLE_WORKER: &str = "worker";
pub const ROLE_LAUNCHER: &str = "launcher";

/// Composite job key, `namespace/name`. Opaque to the work queue.
pub fn job_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a `namespace/name` key back into its parts.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

/// Reference from a child object back to the MPI job that created it.
/// The cluster uses these for cascading deletes; the controller uses them
/// to refuse adopting objects it does not own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: Uuid,
    pub controller: bool,
}

/// Standard object metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: Uuid,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: Uuid::new_v4(),
            labels: HashMap::new(),
            owner_references: Vec::new(),
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
        }
    }

    /// Whether this object is controlled by the owner with the given UID.
    pub fn is_owned_by(&self, owner_uid: Uuid) -> bool {
        self.owner_references
            .iter()
            .any(|r| r.controller && r.uid == owner_uid)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Pod lifecycle phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A pod, reduced to what the scheduler reads: phase, readiness, and the
/// IP the rescale client dials for launchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub phase: PodPhase,
    /// True when the pod's readiness condition is satisfied.
    pub ready: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Pod {
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running && self.metadata.deletion_timestamp.is_none()
    }
}

/// The launcher's batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub metadata: ObjectMeta,
    pub suspend: bool,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// Finished means the cluster recorded a terminal state for the job.
    pub fn is_finished(&self) -> bool {
        self.completion_time.is_some()
    }

    pub fn has_succeeded(&self) -> bool {
        self.is_finished() && self.failed == 0
    }
}

/// Per-job configuration artifact holding the hostfile and the discovery
/// script the launcher mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

/// Headless service giving worker pods stable DNS names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    pub selector: HashMap<String, String>,
    /// None for headless services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
}

/// SSH auth material shared by the launcher and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, Vec<u8>>,
}
