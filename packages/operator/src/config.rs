use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::common::CleanPodPolicy;

/// Controller configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Total worker-slot capacity the controller may hand out.
    /// Launchers consume a slot too.
    pub pool_size: i32,
    /// Number of dispatcher fibres draining the work queue.
    pub threadiness: usize,
    /// TCP port of the launcher's in-pod control endpoint.
    pub rescale_port: u16,
    /// Upper bound on a single rescale round trip.
    pub rescale_timeout: Duration,
    /// Settle window before an expand rescale is issued, so freshly
    /// created pods have DNS entries and reachable sshd.
    pub expand_grace: Duration,
    /// Worker-pod cleanup policy applied when a job completes and its
    /// CR does not say otherwise.
    pub default_clean_pod_policy: CleanPodPolicy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            pool_size: env::var("POOL_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("POOL_SIZE must be a valid integer")?,
            threadiness: env::var("THREADINESS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("THREADINESS must be a valid number")?,
            rescale_port: env::var("RESCALE_PORT")
                .unwrap_or_else(|_| "1234".to_string())
                .parse()
                .context("RESCALE_PORT must be a valid port")?,
            rescale_timeout: Duration::from_secs(
                env::var("RESCALE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "180".to_string())
                    .parse()
                    .context("RESCALE_TIMEOUT_SECS must be a valid number")?,
            ),
            expand_grace: Duration::from_secs(
                env::var("EXPAND_GRACE_SECS")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .context("EXPAND_GRACE_SECS must be a valid number")?,
            ),
            default_clean_pod_policy: CleanPodPolicy::Running,
        })
    }
}
