// The MPIJob custom resource
//
// Spec/status split follows the cluster convention: the spec is what the
// user asked for, the status is what the controller observed. The
// controller only ever writes the status subresource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::resources::{job_key, ObjectMeta};

/// Which MPI flavor the job runs; decides the env vars injected into the
/// launcher (spec'd per implementation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MpiImplementation {
    #[serde(rename = "OpenMPI")]
    OpenMpi,
    Intel,
    #[serde(rename = "MPICH")]
    Mpich,
}

/// What happens to worker pods when the job finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanPodPolicy {
    /// Keep every pod.
    None,
    /// Delete pods still running; keep terminated ones for log inspection.
    Running,
    /// Delete every pod.
    All,
}

/// Job-level execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
    #[serde(default)]
    pub suspend: bool,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            clean_pod_policy: None,
            backoff_limit: None,
            ttl_seconds_after_finished: None,
            suspend: false,
        }
    }
}

/// Container template for workers and the launcher. Reduced to the fields
/// the builders consume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodTemplate {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Worker replica spec. `min_replicas <= replicas <= max_replicas` is the
/// malleability window the scheduler moves the job inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default)]
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LauncherSpec {
    #[serde(default)]
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpiJobSpec {
    /// Lower value = scheduled first.
    pub priority: i32,
    pub slots_per_worker: i32,
    pub mpi_implementation: MpiImplementation,
    /// Emit the launcher as the first hostfile entry so it contributes
    /// ranks of its own.
    #[serde(default)]
    pub run_launcher_as_worker: bool,
    #[serde(default)]
    pub run_policy: RunPolicy,
    pub worker: WorkerSpec,
    #[serde(default)]
    pub launcher: LauncherSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobConditionType {
    Created,
    Running,
    Succeeded,
    Failed,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: JobConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Pod counts per replica role, keyed by "Worker" / "Launcher" in the
/// status map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

pub const REPLICA_WORKER: &str = "Worker";
pub const REPLICA_LAUNCHER: &str = "Launcher";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MpiJobStatus {
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    #[serde(default)]
    pub replica_statuses: HashMap<String, ReplicaStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl MpiJobStatus {
    /// Record a condition transition, replacing any previous condition of
    /// the same type.
    pub fn set_condition(
        &mut self,
        condition_type: JobConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let condition = JobCondition {
            condition_type,
            status: true,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        };
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }

    /// Mark a condition as no longer holding.
    pub fn clear_condition(&mut self, condition_type: JobConditionType, reason: impl Into<String>) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            existing.status = false;
            existing.reason = reason.into();
            existing.last_transition_time = Utc::now();
        }
    }

    pub fn has_condition(&self, condition_type: JobConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status)
    }
}

/// The MPIJob custom resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpiJob {
    pub metadata: ObjectMeta,
    pub spec: MpiJobSpec,
    #[serde(default)]
    pub status: MpiJobStatus,
}

impl MpiJob {
    /// Composite work-queue key, `namespace/name`.
    pub fn key(&self) -> String {
        job_key(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    pub fn worker_pod_name(&self, index: i32) -> String {
        format!("{}-worker-{}", self.metadata.name, index)
    }

    pub fn service_name(&self) -> String {
        format!("{}-worker", self.metadata.name)
    }

    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.metadata.name)
    }

    pub fn secret_name(&self) -> String {
        format!("{}-ssh", self.metadata.name)
    }

    pub fn launcher_name(&self) -> String {
        format!("{}-launcher", self.metadata.name)
    }

    /// Stable DNS name of a worker pod behind the headless service.
    pub fn worker_dns_name(&self, index: i32) -> String {
        format!(
            "{}.{}.{}.svc",
            self.worker_pod_name(index),
            self.service_name(),
            self.metadata.namespace
        )
    }

    /// DNS name of the launcher pod, used when it runs ranks itself.
    pub fn launcher_dns_name(&self) -> String {
        format!(
            "{}.{}.{}.svc",
            self.launcher_name(),
            self.service_name(),
            self.metadata.namespace
        )
    }

    pub fn clean_pod_policy(&self, default: CleanPodPolicy) -> CleanPodPolicy {
        self.spec.run_policy.clean_pod_policy.unwrap_or(default)
    }

    pub fn is_suspended(&self) -> bool {
        self.spec.run_policy.suspend
    }
}
