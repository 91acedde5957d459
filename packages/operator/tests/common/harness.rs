// Test harness: a controller wired to the in-memory cluster, a scripted
// rescaler, and a spy event recorder.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use operator_core::common::{CleanPodPolicy, MpiJob};
use operator_core::domains::mpijob::{MpiJobController, ReconcileError};
use operator_core::kernel::{MockCluster, ScriptedRescaler, SpyEventRecorder, WorkQueue};
use operator_core::Config;

pub struct TestHarness {
    pub cluster: Arc<MockCluster>,
    pub rescaler: Arc<ScriptedRescaler>,
    pub recorder: Arc<SpyEventRecorder>,
    pub queue: Arc<WorkQueue>,
    pub controller: Arc<MpiJobController>,
    cancel: CancellationToken,
}

impl TestHarness {
    pub fn with_pool(pool_size: i32) -> Self {
        let config = Config {
            pool_size,
            threadiness: 1,
            rescale_port: 1234,
            rescale_timeout: Duration::from_secs(5),
            // Tests do not want the DNS settle window.
            expand_grace: Duration::ZERO,
            default_clean_pod_policy: CleanPodPolicy::Running,
        };
        let cluster = MockCluster::new();
        let rescaler = ScriptedRescaler::new();
        let recorder = SpyEventRecorder::new();
        let queue = WorkQueue::new();
        let controller = Arc::new(MpiJobController::new(
            config,
            cluster.clone(),
            rescaler.clone(),
            recorder.clone(),
            queue.clone(),
        ));
        Self {
            cluster,
            rescaler,
            recorder,
            queue,
            controller,
            cancel: CancellationToken::new(),
        }
    }

    /// Store the CR and run its first reconcile.
    pub async fn submit(&self, job: &MpiJob) {
        self.cluster.add_mpi_job(job.clone());
        self.reconcile_ok(&job.key()).await;
    }

    pub async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        self.controller.reconcile_key(key, &self.cancel).await
    }

    pub async fn reconcile_ok(&self, key: &str) {
        self.reconcile(key)
            .await
            .unwrap_or_else(|e| panic!("reconcile of {} failed: {}", key, e));
    }

    /// Reconcile every key the controller has enqueued until the work
    /// queue is empty.
    pub async fn drain(&self) {
        let mut passes = 0;
        while !self.queue.is_empty() {
            let key = self.queue.get().await.expect("queue unexpectedly shut");
            let _ = self.reconcile(&key).await;
            self.queue.done(&key);
            passes += 1;
            assert!(passes < 100, "work queue did not drain");
        }
    }

    pub async fn free_slots(&self) -> i32 {
        self.controller.state().await.ledger.free()
    }

    pub async fn assert_invariants(&self) {
        self.controller
            .state()
            .await
            .check_invariants()
            .expect("scheduler state invariants violated");
    }

    /// Walk a freshly admitted job to the running state: mark its workers
    /// ready, let the controller create the launcher, then report the
    /// launcher pod as running.
    pub async fn run_to_running(&self, job: &MpiJob, launcher_ip: &str) {
        let key = job.key();
        self.cluster.make_workers_ready(job.namespace(), job.name());
        self.reconcile_ok(&key).await;
        assert!(
            self.cluster
                .batch_job(job.namespace(), &job.launcher_name())
                .is_some(),
            "launcher batch job was not created for {}",
            key
        );
        self.cluster.schedule_launcher_pod(job, launcher_ip);
        self.reconcile_ok(&key).await;
    }
}
