// Test fixtures

use operator_core::common::{
    LauncherSpec, MpiImplementation, MpiJob, MpiJobSpec, MpiJobStatus, ObjectMeta, PodTemplate,
    RunPolicy, WorkerSpec,
};

/// A well-formed MPI job CR with the given malleability window and
/// priority (lower value = scheduled first).
pub fn mpi_job(namespace: &str, name: &str, min: i32, max: i32, priority: i32) -> MpiJob {
    MpiJob {
        metadata: ObjectMeta::new(namespace, name),
        spec: MpiJobSpec {
            priority,
            slots_per_worker: 1,
            mpi_implementation: MpiImplementation::OpenMpi,
            run_launcher_as_worker: false,
            run_policy: RunPolicy::default(),
            worker: WorkerSpec {
                min_replicas: min,
                max_replicas: max,
                template: PodTemplate {
                    image: "mpi/benchmark:latest".to_string(),
                    command: vec![],
                },
            },
            launcher: LauncherSpec {
                template: PodTemplate {
                    image: "mpi/benchmark:latest".to_string(),
                    command: vec!["/opt/bench/solver".to_string()],
                },
            },
        },
        status: MpiJobStatus::default(),
    }
}
