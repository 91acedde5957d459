use thiserror::Error;

/// Errors a reconcile pass can surface to the dispatcher.
///
/// Everything returned here is requeued with backoff. Conditions the
/// dispatcher must NOT retry (validation failures, insufficient capacity)
/// are handled inside the pass: validation emits a warning event and
/// returns cleanly, capacity shortfalls park the job in the queued state.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{kind} {name} exists and is not owned by this job")]
    ResourceExists { kind: &'static str, name: String },

    #[error("rescale failed: {0}")]
    Rescale(anyhow::Error),

    #[error("transient: {0}")]
    Transient(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(anyhow::anyhow!(message.into()))
    }
}
