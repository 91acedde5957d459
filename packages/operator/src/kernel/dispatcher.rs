//! Dispatcher draining the work queue into the reconciler.
//!
//! Runs `threadiness` worker fibres. Each pulls a key from the rate-limited
//! work queue, runs one reconcile pass, and:
//! - on success, forgets the key's failure history;
//! - on error, re-adds the key with rate-limit backoff.
//!
//! The queue guarantees at most one in-flight pass per key, so reconciles
//! of the same job never race; reconciles of different jobs may.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::BaseReconciler;
use super::workqueue::WorkQueue;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of worker fibres draining the queue.
    pub threadiness: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { threadiness: 1 }
    }
}

pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn BaseReconciler>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<dyn BaseReconciler>) -> Self {
        Self {
            queue,
            reconciler,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(
        queue: Arc<WorkQueue>,
        reconciler: Arc<dyn BaseReconciler>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            reconciler,
            config,
        }
    }

    /// Run until the token is cancelled and the queue has drained.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(threadiness = self.config.threadiness, "dispatcher starting");

        let mut fibres = Vec::with_capacity(self.config.threadiness);
        for fibre_id in 0..self.config.threadiness {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            let shutdown = shutdown.clone();
            fibres.push(tokio::spawn(async move {
                worker_fibre(fibre_id, queue, reconciler, shutdown).await;
            }));
        }

        // The queue refuses new keys once shut down; fibres exit when it
        // drains.
        shutdown.cancelled().await;
        self.queue.shut_down();
        join_all(fibres).await;

        info!("dispatcher stopped");
    }
}

async fn worker_fibre(
    fibre_id: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn BaseReconciler>,
    shutdown: CancellationToken,
) {
    debug!(fibre_id, "worker fibre starting");

    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key, &shutdown).await {
            Ok(()) => {
                queue.forget(&key);
            }
            Err(e) => {
                warn!(job = %key, error = %e, "reconcile failed, requeueing with backoff");
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }

    debug!(fibre_id, "worker fibre stopped");
}
