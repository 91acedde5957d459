//! CR validation, run once per reconcile before anything else.
//!
//! A job that fails validation gets a warning event and is NOT requeued;
//! the user has to fix the spec.

use crate::common::MpiJob;

pub fn validate(job: &MpiJob) -> Result<(), String> {
    if job.metadata.name.is_empty() {
        return Err("metadata.name must not be empty".to_string());
    }
    if job.metadata.namespace.is_empty() {
        return Err("metadata.namespace must not be empty".to_string());
    }

    let worker = &job.spec.worker;
    if worker.min_replicas < 1 {
        return Err(format!(
            "worker.minReplicas must be at least 1, got {}",
            worker.min_replicas
        ));
    }
    if worker.min_replicas > worker.max_replicas {
        return Err(format!(
            "worker.minReplicas ({}) must not exceed worker.maxReplicas ({})",
            worker.min_replicas, worker.max_replicas
        ));
    }
    if job.spec.slots_per_worker < 1 {
        return Err(format!(
            "slotsPerWorker must be at least 1, got {}",
            job.spec.slots_per_worker
        ));
    }
    if let Some(backoff_limit) = job.spec.run_policy.backoff_limit {
        if backoff_limit < 0 {
            return Err(format!(
                "runPolicy.backoffLimit must not be negative, got {}",
                backoff_limit
            ));
        }
    }

    Ok(())
}
