//! Deterministic builders for the child objects of an MPI job.
//!
//! Everything built here carries an owner reference back to the job so the
//! cluster cascades deletes and the controller can refuse foreign objects.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::common::{
    BatchJob, ConfigMap, MpiImplementation, MpiJob, ObjectMeta, OwnerReference, Pod, PodPhase,
    Secret, Service, LABEL_JOB_NAME, LABEL_JOB_ROLE, ROLE_LAUNCHER, ROLE_WORKER,
};

use super::hostfile::{DISCOVER_HOSTS_KEY, HOSTFILE_KEY, HOSTFILE_MOUNT_PATH};

/// Shared auth material mounted by the launcher and every worker; the pod
/// entrypoints derive the actual SSH keypair from it.
pub const SSH_AUTH_KEY: &str = "auth-key";

pub fn owner_reference(job: &MpiJob) -> OwnerReference {
    OwnerReference {
        kind: "MPIJob".to_string(),
        name: job.name().to_string(),
        uid: job.metadata.uid,
        controller: true,
    }
}

fn child_meta(job: &MpiJob, name: String, role: &str) -> ObjectMeta {
    let mut meta = ObjectMeta::new(job.namespace(), name);
    meta.labels
        .insert(LABEL_JOB_NAME.to_string(), job.name().to_string());
    meta.labels
        .insert(LABEL_JOB_ROLE.to_string(), role.to_string());
    meta.owner_references.push(owner_reference(job));
    meta
}

pub fn new_worker_pod(job: &MpiJob, index: i32) -> Pod {
    Pod {
        metadata: child_meta(job, job.worker_pod_name(index), ROLE_WORKER),
        image: job.spec.worker.template.image.clone(),
        command: job.spec.worker.template.command.clone(),
        ip: None,
        phase: PodPhase::Pending,
        ready: false,
        env: BTreeMap::new(),
    }
}

/// Recover the worker index from a pod name, `<job>-worker-<index>`.
pub fn worker_index(job: &MpiJob, pod_name: &str) -> Option<i32> {
    pod_name
        .strip_prefix(&format!("{}-worker-", job.name()))?
        .parse()
        .ok()
}

/// CLI arguments injected into the launcher: the rank count, the nodelist,
/// and the control endpoint the rescale client dials.
pub fn launcher_args(job: &MpiJob, worker_replicas: i32, rescale_port: u16) -> Vec<String> {
    let mut args = job.spec.launcher.template.command.clone();
    args.extend(
        [
            "+p",
            &worker_replicas.to_string(),
            "++nodelist",
            HOSTFILE_MOUNT_PATH,
            "++server",
            "++server-port",
            &rescale_port.to_string(),
        ]
        .map(String::from),
    );
    args
}

const RSH_RETRY_ARGS: &str = "-o ConnectionAttempts=10";

/// Environment the MPI implementation needs to find the hostfile and
/// tolerate workers whose sshd is still coming up.
pub fn launcher_env(job: &MpiJob) -> BTreeMap<String, String> {
    let slots = job.spec.slots_per_worker.to_string();
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };
    match job.spec.mpi_implementation {
        MpiImplementation::OpenMpi => {
            set("OMPI_MCA_orte_keep_fqdn_hostnames", "true".to_string());
            set(
                "OMPI_MCA_orte_default_hostfile",
                HOSTFILE_MOUNT_PATH.to_string(),
            );
            set("OMPI_MCA_plm_rsh_args", RSH_RETRY_ARGS.to_string());
            set("OMPI_MCA_orte_set_default_slots", slots);
        }
        MpiImplementation::Intel => {
            set("I_MPI_HYDRA_HOST_FILE", HOSTFILE_MOUNT_PATH.to_string());
            set(
                "I_MPI_HYDRA_BOOTSTRAP_EXEC_EXTRA_ARGS",
                RSH_RETRY_ARGS.to_string(),
            );
            set("I_MPI_PERHOST", slots);
        }
        MpiImplementation::Mpich => {
            set("HYDRA_HOST_FILE", HOSTFILE_MOUNT_PATH.to_string());
            set("HYDRA_LAUNCH_EXTRA_ARGS", RSH_RETRY_ARGS.to_string());
        }
    }
    env
}

pub fn new_launcher_job(job: &MpiJob, worker_replicas: i32, rescale_port: u16) -> BatchJob {
    BatchJob {
        metadata: child_meta(job, job.launcher_name(), ROLE_LAUNCHER),
        suspend: job.is_suspended(),
        command: launcher_args(job, worker_replicas, rescale_port),
        env: launcher_env(job),
        active: 0,
        succeeded: 0,
        failed: 0,
        start_time: None,
        completion_time: None,
    }
}

/// Headless service giving every pod of the job a stable DNS name.
pub fn new_service(job: &MpiJob) -> Service {
    Service {
        metadata: child_meta(job, job.service_name(), ROLE_WORKER),
        selector: [(LABEL_JOB_NAME.to_string(), job.name().to_string())]
            .into_iter()
            .collect(),
        cluster_ip: None,
    }
}

pub fn new_ssh_auth_secret(job: &MpiJob) -> Secret {
    let mut seed = Vec::with_capacity(32);
    seed.extend_from_slice(Uuid::new_v4().as_bytes());
    seed.extend_from_slice(Uuid::new_v4().as_bytes());
    Secret {
        metadata: child_meta(job, job.secret_name(), ROLE_WORKER),
        data: [(SSH_AUTH_KEY.to_string(), seed)].into_iter().collect(),
    }
}

pub fn new_config_map(job: &MpiJob, hostfile: &str, discover_hosts: &str) -> ConfigMap {
    ConfigMap {
        metadata: child_meta(job, job.config_map_name(), ROLE_WORKER),
        data: [
            (HOSTFILE_KEY.to_string(), hostfile.to_string()),
            (DISCOVER_HOSTS_KEY.to_string(), discover_hosts.to_string()),
        ]
        .into_iter()
        .collect(),
    }
}
