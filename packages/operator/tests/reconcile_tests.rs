//! Lifecycle tests for the job state machine: admission through
//! completion, expansion, rescale retry, suspension, and the ownership
//! and validation edges.

mod common;

use common::*;
use operator_core::common::{JobConditionType, PodPhase};
use operator_core::domains::mpijob::hostfile::HOSTFILE_KEY;
use operator_core::domains::mpijob::ReconcileError;
use operator_core::kernel::RescaleCall;

#[tokio::test]
async fn happy_admission_runs_and_completes() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 2, 4, 0);

    // Admission grants up to max, keeping the launcher slot back.
    h.submit(&job).await;
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 4);
    assert_eq!(h.free_slots().await, 5);
    assert!(h.recorder.has_reason("MPIJobCreated"));
    assert!(h.cluster.service("hpc", "alpha-worker").is_some());
    assert!(h.cluster.secret("hpc", "alpha-ssh").is_some());

    // Hostfile lists every admitted worker.
    let config_map = h.cluster.config_map("hpc", "alpha-config").unwrap();
    let hostfile = config_map.data.get(HOSTFILE_KEY).unwrap();
    assert_eq!(hostfile.lines().count(), 4);
    assert!(hostfile.contains("alpha-worker-0.alpha-worker.hpc.svc ++cpus 1"));

    // Workers ready -> launcher -> running.
    h.run_to_running(&job, "10.0.0.9").await;
    assert!(h.recorder.has_reason("MPIJobRunning"));
    assert_eq!(h.free_slots().await, 5);
    h.assert_invariants().await;

    let launcher = h.cluster.batch_job("hpc", "alpha-launcher").unwrap();
    assert!(launcher.command.contains(&"+p".to_string()));
    assert!(launcher.command.contains(&"4".to_string()));
    assert!(launcher.command.contains(&"++server-port".to_string()));

    // Completion releases the workers and the launcher slot.
    h.cluster.finish_launcher("hpc", "alpha-launcher", true);
    h.reconcile_ok("hpc/alpha").await;
    assert_eq!(h.free_slots().await, 10);
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 0);
    assert!(h.recorder.has_reason("MPIJobSucceeded"));
    let stored = h.cluster.mpi_job("hpc", "alpha").unwrap();
    assert!(stored.status.completion_time.is_some());
    assert!(stored.status.has_condition(JobConditionType::Succeeded));
    h.assert_invariants().await;
}

#[tokio::test]
async fn completed_job_frees_slots_exactly_once() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 2, 4, 0);
    h.submit(&job).await;
    h.run_to_running(&job, "10.0.0.9").await;

    h.cluster.finish_launcher("hpc", "alpha-launcher", true);
    h.reconcile_ok("hpc/alpha").await;
    assert_eq!(h.free_slots().await, 10);

    // A second observation of the finished job must not move the ledger.
    h.reconcile_ok("hpc/alpha").await;
    h.reconcile_ok("hpc/alpha").await;
    assert_eq!(h.free_slots().await, 10);
    h.assert_invariants().await;
}

#[tokio::test]
async fn failed_launcher_reports_failure() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 1, 2, 0);
    h.submit(&job).await;
    h.run_to_running(&job, "10.0.0.9").await;

    h.cluster.finish_launcher("hpc", "alpha-launcher", false);
    h.reconcile_ok("hpc/alpha").await;
    assert!(h.recorder.has_reason("MPIJobFailed"));
    assert_eq!(h.free_slots().await, 10);
}

#[tokio::test]
async fn completion_expands_lower_priority_job() {
    let h = TestHarness::with_pool(10);
    let a = mpi_job("hpc", "alpha", 2, 4, 0);
    let b = mpi_job("hpc", "beta", 2, 8, 1);

    h.submit(&a).await;
    assert_eq!(h.free_slots().await, 5);
    h.submit(&b).await;
    // Beta gets what is left after its launcher slot: 4 workers.
    assert_eq!(h.cluster.pod_count("hpc", "beta"), 4);
    assert_eq!(h.free_slots().await, 0);

    h.run_to_running(&a, "10.0.0.2").await;
    h.run_to_running(&b, "10.0.0.3").await;

    // Alpha finishing frees 5 slots; the rebalancer hands them to beta.
    h.cluster.finish_launcher("hpc", "alpha-launcher", true);
    h.reconcile_ok("hpc/alpha").await;
    assert_eq!(h.free_slots().await, 5);

    // Beta's key was enqueued; its pass grows the pod set.
    h.drain().await;
    assert_eq!(h.cluster.pod_count("hpc", "beta"), 8);
    assert_eq!(h.free_slots().await, 1);

    // Once the new pods are ready the deferred expand fires.
    h.cluster.make_workers_ready("hpc", "beta");
    h.reconcile_ok("hpc/beta").await;
    assert_eq!(
        h.rescaler.calls(),
        vec![RescaleCall {
            host: "10.0.0.3".to_string(),
            port: 1234,
            old_procs: 4,
            new_procs: 8,
        }]
    );
    assert!(h
        .controller
        .state()
        .await
        .pending_rescale
        .is_empty());
    h.assert_invariants().await;
}

#[tokio::test]
async fn failed_expand_rescale_is_retried_until_it_succeeds() {
    let h = TestHarness::with_pool(7);
    // Occupier keeps alpha small at admission.
    let occupier = mpi_job("hpc", "occ", 2, 2, 0);
    let a = mpi_job("hpc", "alpha", 3, 6, 1);

    h.submit(&occupier).await;
    h.run_to_running(&occupier, "10.0.0.2").await;
    h.submit(&a).await;
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 3);
    h.run_to_running(&a, "10.0.0.3").await;
    assert_eq!(h.free_slots().await, 0);

    // Occupier completes; alpha is granted 3 more workers.
    h.cluster.finish_launcher("hpc", "occ-launcher", true);
    h.reconcile_ok("hpc/occ").await;
    h.drain().await;
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 6);
    h.cluster.make_workers_ready("hpc", "alpha");

    // The launcher rejects the first expand.
    h.rescaler.push_verdict(false);
    let err = h.reconcile("hpc/alpha").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Rescale(_)));

    // Pods stay; the pending transition survives for the retry.
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 6);
    {
        let state = h.controller.state().await;
        let pending = state.pending_rescale.get("hpc/alpha").unwrap();
        assert_eq!((pending.from, pending.to), (3, 6));
    }

    // Next pass observes the same state and succeeds.
    h.reconcile_ok("hpc/alpha").await;
    let calls = h.rescaler.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!((calls[1].old_procs, calls[1].new_procs), (3, 6));
    assert!(h.controller.state().await.pending_rescale.is_empty());
    h.assert_invariants().await;
}

#[tokio::test]
async fn suspension_deletes_workers_and_resume_restores_them() {
    let h = TestHarness::with_pool(10);
    let mut job = mpi_job("hpc", "alpha", 2, 2, 0);
    h.submit(&job).await;
    h.run_to_running(&job, "10.0.0.9").await;
    assert_eq!(h.free_slots().await, 7);

    // Suspend: workers go away, their slots come back, the launcher is
    // told to suspend.
    job.spec.run_policy.suspend = true;
    h.cluster.add_mpi_job(job.clone());
    h.reconcile_ok("hpc/alpha").await;
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 0);
    assert_eq!(h.free_slots().await, 9);
    assert!(h.cluster.batch_job("hpc", "alpha-launcher").unwrap().suspend);
    assert!(h.recorder.has_reason("MPIJobSuspended"));

    // Resume: pods come back, the launcher resumes, start time resets.
    job.spec.run_policy.suspend = false;
    h.cluster.add_mpi_job(job.clone());
    h.reconcile_ok("hpc/alpha").await;
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 2);
    assert_eq!(h.free_slots().await, 7);
    assert!(!h.cluster.batch_job("hpc", "alpha-launcher").unwrap().suspend);
    assert!(h.recorder.has_reason("MPIJobResumed"));
    let stored = h.cluster.mpi_job("hpc", "alpha").unwrap();
    assert!(stored.status.start_time.is_some());
    assert!(!stored.status.has_condition(JobConditionType::Suspended));
    h.assert_invariants().await;
}

#[tokio::test]
async fn foreign_config_map_is_never_adopted() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 1, 2, 0);

    // Someone else owns the name the controller wants.
    let foreign = mpi_job("hpc", "squatter", 1, 1, 0);
    let mut config_map = operator_core::domains::mpijob::templates::new_config_map(
        &foreign,
        "host stolen ++cpus 1\n",
        "#!/bin/sh\n",
    );
    config_map.metadata.name = "alpha-config".to_string();
    h.cluster.put_config_map(config_map);

    h.cluster.add_mpi_job(job.clone());
    let err = h.reconcile("hpc/alpha").await.unwrap_err();
    assert!(matches!(err, ReconcileError::ResourceExists { .. }));
    assert!(h.recorder.has_reason("ErrResourceExists"));

    // The squatter's data was not overwritten.
    let stored = h.cluster.config_map("hpc", "alpha-config").unwrap();
    assert_eq!(
        stored.data.get(HOSTFILE_KEY).unwrap(),
        "host stolen ++cpus 1\n"
    );
}

#[tokio::test]
async fn invalid_job_gets_warning_event_and_no_state() {
    let h = TestHarness::with_pool(10);
    // min > max fails validation.
    let job = mpi_job("hpc", "broken", 5, 2, 0);
    h.cluster.add_mpi_job(job.clone());

    // Not an error: validation failures must not be requeued.
    h.reconcile_ok("hpc/broken").await;
    assert!(h.recorder.has_reason("ValidationError"));
    assert!(!h.controller.state().await.is_tracked("hpc/broken"));
    assert_eq!(h.free_slots().await, 10);
}

#[tokio::test]
async fn hostfile_reconcile_is_idempotent() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 2, 2, 0);
    h.submit(&job).await;

    let first = h.cluster.config_map("hpc", "alpha-config").unwrap();
    h.reconcile_ok("hpc/alpha").await;
    let second = h.cluster.config_map("hpc", "alpha-config").unwrap();
    assert_eq!(first.data, second.data);
}

#[tokio::test]
async fn worker_pods_are_recreated_when_lost() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 3, 3, 0);
    h.submit(&job).await;
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 3);

    // A node eats a pod; the ledger learns via the delete notification.
    let pods = h.cluster.worker_pods("hpc", "alpha");
    let lost = &pods[1].metadata.name;
    use operator_core::kernel::BaseObjectStore;
    h.cluster.delete_pod("hpc", lost).await.unwrap();
    {
        let mut state = h.controller.state().await;
        state.ledger.release(1);
    }

    h.reconcile_ok("hpc/alpha").await;
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 3);
    assert_eq!(h.free_slots().await, 6);
    h.assert_invariants().await;
}

#[tokio::test]
async fn terminated_workers_survive_running_clean_pod_policy() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 2, 2, 0);
    h.submit(&job).await;
    h.run_to_running(&job, "10.0.0.9").await;

    // One worker already finished on its own.
    {
        let pods = h.cluster.worker_pods("hpc", "alpha");
        let name = pods[0].metadata.name.clone();
        use operator_core::kernel::BaseObjectStore;
        let mut done = h.cluster.get_pod("hpc", &name).await.unwrap().unwrap();
        done.phase = PodPhase::Succeeded;
        done.ready = false;
        h.cluster.delete_pod("hpc", &name).await.unwrap();
        h.cluster.create_pod(done).await.unwrap();
    }

    h.cluster.finish_launcher("hpc", "alpha-launcher", true);
    h.reconcile_ok("hpc/alpha").await;

    // Running policy keeps the terminated pod; its slot stays accounted.
    assert_eq!(h.cluster.pod_count("hpc", "alpha"), 1);
    assert_eq!(h.free_slots().await, 9);
    h.assert_invariants().await;
}
