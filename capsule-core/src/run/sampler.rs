//! Periodic resource sampling for run containers.
//!
//! Each sample appends one line to the run's `.resources` file:
//!
//! ```text
//! 2024-05-01T10:00:05Z cpu=12.50% mem=1048576/2097152 (50.00%) net_rx=512 net_tx=128 ...
//! ```
//!
//! CPU is the share of host CPU used since the previous sample; network and
//! block counters are deltas since the previous sample.

use crate::engine::{ContainerEngine, StatsSnapshot};
use crate::error::{CapsuleError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Name of the sample file inside the run mount.
pub const RESOURCES_FILE: &str = ".resources";

/// Format one sample line.
pub fn format_sample(
    at: DateTime<Utc>,
    previous: Option<&StatsSnapshot>,
    current: &StatsSnapshot,
) -> String {
    let base = previous.copied().unwrap_or_default();
    let cpu = match previous {
        Some(prev) => cpu_percent(prev, current),
        None => 0.0,
    };
    let mem_percent = if current.memory_limit > 0 {
        current.memory_usage as f64 / current.memory_limit as f64 * 100.0
    } else {
        0.0
    };

    format!(
        "{} cpu={:.2}% mem={}/{} ({:.2}%) net_rx={} net_tx={} blk_read={} blk_write={}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        cpu,
        current.memory_usage,
        current.memory_limit,
        mem_percent,
        current.net_rx.saturating_sub(base.net_rx),
        current.net_tx.saturating_sub(base.net_tx),
        current.blk_read.saturating_sub(base.blk_read),
        current.blk_write.saturating_sub(base.blk_write),
    )
}

fn cpu_percent(prev: &StatsSnapshot, current: &StatsSnapshot) -> f64 {
    let cpu_delta = current.cpu_total.saturating_sub(prev.cpu_total) as f64;
    let system_delta = current.system_cpu.saturating_sub(prev.system_cpu) as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }
    let cpus = current.online_cpus.max(1) as f64;
    cpu_delta / system_delta * cpus * 100.0
}

/// Samples a container's resource usage until cancelled or the container is gone.
pub struct ResourceSampler {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
    output: PathBuf,
    interval: Duration,
}

impl ResourceSampler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        container_id: impl Into<String>,
        output: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self { engine, container_id: container_id.into(), output: output.into(), interval }
    }

    /// Sample until `token` fires. Returns the number of samples written.
    pub async fn run(self, token: CancellationToken) -> Result<usize> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output)
            .await
            .map_err(|e| CapsuleError::io(&self.output, e))?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous: Option<StatsSnapshot> = None;
        let mut written = 0;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = match self.engine.stats(&self.container_id).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => {
                    debug!(container = %self.container_id, "No stats, sampler stopping");
                    break;
                }
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    warn!(container = %self.container_id, error = %e, "Stats sample failed");
                    continue;
                }
            };

            let mut line = format_sample(Utc::now(), previous.as_ref(), &snapshot);
            line.push('\n');
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| CapsuleError::io(&self.output, e))?;
            previous = Some(snapshot);
            written += 1;
        }

        file.flush().await.map_err(|e| CapsuleError::io(&self.output, e))?;
        Ok(written)
    }
}
