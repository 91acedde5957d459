//! Event recorder backed by the tracing subscriber.

use tracing::{info, warn};

use super::traits::{truncate_event_message, BaseEventRecorder, EventType};
use crate::common::MpiJob;

/// Records job events as structured log lines. Deployments that want
/// cluster-native events plug their own [`BaseEventRecorder`] in instead.
pub struct LogEventRecorder;

impl BaseEventRecorder for LogEventRecorder {
    fn event(&self, job: &MpiJob, event_type: EventType, reason: &str, message: &str) {
        let message = truncate_event_message(message);
        match event_type {
            EventType::Normal => info!(job = %job.key(), reason, message, "event"),
            EventType::Warning => warn!(job = %job.key(), reason, message, "event"),
        }
    }
}
