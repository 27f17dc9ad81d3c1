//! Seams towards the upstream task framework.
//!
//! The framework drives builds and runs, collects progress messages and is told when
//! an abandoned run has been failed. Cancellation flows the other way as a
//! [`tokio_util::sync::CancellationToken`].

use crate::error::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Receives human-readable progress messages (build output, run logs).
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Progress sink that forwards messages to the tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, message: &str) {
        info!(target: "capsule::progress", "{}", message);
    }
}

/// Notifies the upstream job system about runs failed out-of-band.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn job_failed(&self, job_id: &str, message: &str) -> Result<()>;
}

/// Notifier used when no job system is attached; the failure is only logged.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl JobNotifier for LoggingNotifier {
    async fn job_failed(&self, job_id: &str, message: &str) -> Result<()> {
        warn!(job_id = %job_id, "Job failed: {}", message);
        Ok(())
    }
}
