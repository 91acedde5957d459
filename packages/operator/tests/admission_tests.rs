//! Admission, preemption, and rebalancing behavior: who gets slots, who
//! waits, and who gets shrunk to make room.

mod common;

use common::*;

#[tokio::test]
async fn preemption_shrinks_lower_priority_job() {
    let h = TestHarness::with_pool(5);
    let low = mpi_job("hpc", "low", 1, 4, 10);
    h.submit(&low).await;
    assert_eq!(h.cluster.pod_count("hpc", "low"), 4);
    h.run_to_running(&low, "10.0.0.2").await;
    assert_eq!(h.free_slots().await, 0);

    // High priority arrives; low sheds down to its minimum.
    let high = mpi_job("hpc", "high", 2, 2, 0);
    h.submit(&high).await;

    let calls = h.rescaler.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].host, "10.0.0.2");
    assert_eq!((calls[0].old_procs, calls[0].new_procs), (4, 1));

    assert_eq!(h.cluster.pod_count("hpc", "low"), 1);
    assert_eq!(h.cluster.pod_count("hpc", "high"), 2);
    assert_eq!(h.free_slots().await, 0);
    {
        let state = h.controller.state().await;
        assert_eq!(state.latest_replicas.get("hpc/low"), Some(&1));
        assert_eq!(state.latest_replicas.get("hpc/high"), Some(&2));
    }

    // The victim's key was enqueued so its hostfile catches up.
    h.drain().await;
    let config_map = h.cluster.config_map("hpc", "low-config").unwrap();
    let hostfile = config_map
        .data
        .get(operator_core::domains::mpijob::hostfile::HOSTFILE_KEY)
        .unwrap();
    assert_eq!(hostfile.lines().count(), 1);
    h.assert_invariants().await;
}

#[tokio::test]
async fn dry_run_shortfall_queues_without_any_rescale() {
    let h = TestHarness::with_pool(4);
    let low = mpi_job("hpc", "low", 2, 4, 10);
    h.submit(&low).await;
    assert_eq!(h.cluster.pod_count("hpc", "low"), 3);
    h.run_to_running(&low, "10.0.0.2").await;
    assert_eq!(h.free_slots().await, 0);

    // Low can only shed one worker; high needs three slots. The dry run
    // fails, so no rescale is ever issued and low keeps its workers.
    let high = mpi_job("hpc", "high", 2, 2, 0);
    h.submit(&high).await;

    assert_eq!(h.rescaler.call_count(), 0);
    assert_eq!(h.cluster.pod_count("hpc", "low"), 3);
    assert_eq!(h.cluster.pod_count("hpc", "high"), 0);
    {
        let state = h.controller.state().await;
        assert!(state.queued_jobs.contains("hpc/high"));
        assert_eq!(state.latest_replicas.get("hpc/low"), Some(&3));
    }
    h.assert_invariants().await;
}

#[tokio::test]
async fn equal_priority_work_is_never_preempted() {
    let h = TestHarness::with_pool(4);
    let first = mpi_job("hpc", "first", 2, 3, 0);
    h.submit(&first).await;
    h.run_to_running(&first, "10.0.0.2").await;
    assert_eq!(h.free_slots().await, 0);

    let second = mpi_job("hpc", "second", 2, 2, 0);
    h.submit(&second).await;

    assert_eq!(h.rescaler.call_count(), 0);
    assert_eq!(h.cluster.pod_count("hpc", "first"), 3);
    assert!(h.controller.state().await.queued_jobs.contains("hpc/second"));
}

#[tokio::test]
async fn failed_preemption_rescale_leaves_victim_untouched() {
    let h = TestHarness::with_pool(5);
    let low = mpi_job("hpc", "low", 1, 4, 10);
    h.submit(&low).await;
    h.run_to_running(&low, "10.0.0.2").await;

    // The victim's launcher refuses the shrink.
    h.rescaler.push_verdict(false);
    let high = mpi_job("hpc", "high", 2, 2, 0);
    h.submit(&high).await;

    assert_eq!(h.rescaler.call_count(), 1);
    assert_eq!(h.cluster.pod_count("hpc", "low"), 4);
    assert_eq!(h.cluster.pod_count("hpc", "high"), 0);
    {
        let state = h.controller.state().await;
        assert_eq!(state.latest_replicas.get("hpc/low"), Some(&4));
        assert!(state.queued_jobs.contains("hpc/high"));
    }
    assert_eq!(h.free_slots().await, 0);
    h.assert_invariants().await;
}

#[tokio::test]
async fn queued_job_is_promoted_when_capacity_frees() {
    let h = TestHarness::with_pool(5);
    let occupier = mpi_job("hpc", "occ", 3, 3, 0);
    h.submit(&occupier).await;
    h.run_to_running(&occupier, "10.0.0.2").await;
    assert_eq!(h.free_slots().await, 1);

    // Cannot preempt higher-priority work: parked.
    let parked = mpi_job("hpc", "parked", 2, 2, 5);
    h.submit(&parked).await;
    assert!(h.controller.state().await.queued_jobs.contains("hpc/parked"));

    // The occupier completing promotes the parked job.
    h.cluster.finish_launcher("hpc", "occ-launcher", true);
    h.reconcile_ok("hpc/occ").await;
    assert!(!h
        .controller
        .state()
        .await
        .queued_jobs
        .contains("hpc/parked"));

    h.drain().await;
    assert_eq!(h.cluster.pod_count("hpc", "parked"), 2);
    assert_eq!(h.free_slots().await, 2);

    h.run_to_running(&parked, "10.0.0.3").await;
    h.assert_invariants().await;
}

#[tokio::test]
async fn promotion_skips_jobs_whose_minimum_does_not_fit() {
    let h = TestHarness::with_pool(5);
    let occupier = mpi_job("hpc", "occ", 3, 3, 0);
    h.submit(&occupier).await;
    h.run_to_running(&occupier, "10.0.0.2").await;

    let big = mpi_job("hpc", "big", 5, 5, 1);
    h.submit(&big).await;
    let small = mpi_job("hpc", "small", 1, 1, 2);
    h.submit(&small).await;
    {
        let state = h.controller.state().await;
        assert!(state.queued_jobs.contains("hpc/big"));
        assert!(state.queued_jobs.contains("hpc/small"));
    }

    // Five slots free up, but big needs five workers plus a launcher.
    // It is skipped; small fits behind it.
    h.cluster.finish_launcher("hpc", "occ-launcher", true);
    h.reconcile_ok("hpc/occ").await;
    {
        let state = h.controller.state().await;
        assert!(state.queued_jobs.contains("hpc/big"));
        assert!(!state.queued_jobs.contains("hpc/small"));
    }

    h.drain().await;
    assert_eq!(h.cluster.pod_count("hpc", "small"), 1);
    h.assert_invariants().await;
}

#[tokio::test]
async fn rebalance_with_no_capacity_change_preserves_free_slots() {
    let h = TestHarness::with_pool(10);
    let job = mpi_job("hpc", "alpha", 2, 4, 0);
    h.submit(&job).await;
    h.run_to_running(&job, "10.0.0.9").await;
    assert_eq!(h.free_slots().await, 5);

    // Already at max; rebalancing moves nothing and the ledger is
    // untouched.
    h.controller.rebalance_now().await.unwrap();
    assert_eq!(h.free_slots().await, 5);
    assert_eq!(
        h.controller.state().await.latest_replicas.get("hpc/alpha"),
        Some(&4)
    );
}

#[tokio::test]
async fn ledger_identity_holds_across_a_full_lifecycle() {
    let h = TestHarness::with_pool(8);
    let a = mpi_job("hpc", "a", 1, 3, 0);
    let b = mpi_job("hpc", "b", 1, 3, 1);

    h.submit(&a).await;
    h.submit(&b).await;
    // free + worker pods + launcher reservations must always equal pool.
    let pods = h.cluster.pod_count("hpc", "a") + h.cluster.pod_count("hpc", "b");
    assert_eq!(h.free_slots().await + pods as i32 + 2, 8);

    h.run_to_running(&a, "10.0.0.2").await;
    h.run_to_running(&b, "10.0.0.3").await;

    h.cluster.finish_launcher("hpc", "a-launcher", true);
    h.reconcile_ok("hpc/a").await;
    h.drain().await;
    let pods = h.cluster.pod_count("hpc", "b") as i32;
    assert_eq!(h.free_slots().await + pods + 1, 8);
    h.assert_invariants().await;
}
