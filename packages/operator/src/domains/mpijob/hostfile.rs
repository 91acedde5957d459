//! Hostfile rendering and reconciliation.
//!
//! The hostfile lists one line per host, `host <dns-name> ++cpus <slots>`,
//! launcher first iff it runs ranks itself. The companion
//! `discover_hosts.sh` echoes the currently-running pods sorted by name so
//! in-pod tooling can learn the live membership without the API server.
//!
//! Rendering is pure; [`reconcile_config_map`] pushes the rendered text
//! into the per-job config artifact (create, refuse foreign owners,
//! update on drift). The controller separately remembers what it last
//! committed so a later pass can tell whether the cluster has converged.

use crate::common::{ConfigMap, MpiJob, Pod};
use crate::kernel::BaseObjectStore;

use super::error::ReconcileError;
use super::templates;

pub const HOSTFILE_KEY: &str = "hostfile";
pub const DISCOVER_HOSTS_KEY: &str = "discover_hosts.sh";
/// Where the launcher pod mounts the hostfile.
pub const HOSTFILE_MOUNT_PATH: &str = "/etc/mpi/hostfile";

pub fn render_hostfile(job: &MpiJob, worker_replicas: i32) -> String {
    let slots = job.spec.slots_per_worker;
    let mut out = String::new();
    if job.spec.run_launcher_as_worker {
        out.push_str(&format!(
            "host {} ++cpus {}\n",
            job.launcher_dns_name(),
            slots
        ));
    }
    for index in 0..worker_replicas {
        out.push_str(&format!(
            "host {} ++cpus {}\n",
            job.worker_dns_name(index),
            slots
        ));
    }
    out
}

pub fn render_discover_hosts(job: &MpiJob, pods: &[Pod]) -> String {
    let mut names: Vec<&str> = pods
        .iter()
        .filter(|p| p.is_running())
        .map(|p| p.metadata.name.as_str())
        .collect();
    names.sort_unstable();

    let mut out = String::from("#!/bin/sh\n");
    for name in names {
        out.push_str(&format!(
            "echo {}.{}.{}.svc\n",
            name,
            job.service_name(),
            job.namespace()
        ));
    }
    out
}

/// Bring the per-job config artifact in line with the rendered text.
pub async fn reconcile_config_map(
    store: &dyn BaseObjectStore,
    job: &MpiJob,
    hostfile: &str,
    discover_hosts: &str,
) -> Result<(), ReconcileError> {
    let name = job.config_map_name();
    match store.get_config_map(job.namespace(), &name).await? {
        None => {
            let config_map = templates::new_config_map(job, hostfile, discover_hosts);
            store.create_config_map(config_map).await?;
        }
        Some(existing) => {
            if !existing.metadata.is_owned_by(job.metadata.uid) {
                return Err(ReconcileError::ResourceExists {
                    kind: "config map",
                    name,
                });
            }
            if existing.data.get(HOSTFILE_KEY).map(String::as_str) != Some(hostfile)
                || existing.data.get(DISCOVER_HOSTS_KEY).map(String::as_str)
                    != Some(discover_hosts)
            {
                let mut updated: ConfigMap = existing;
                updated
                    .data
                    .insert(HOSTFILE_KEY.to_string(), hostfile.to_string());
                updated
                    .data
                    .insert(DISCOVER_HOSTS_KEY.to_string(), discover_hosts.to_string());
                store.update_config_map(updated).await?;
            }
        }
    }
    Ok(())
}
