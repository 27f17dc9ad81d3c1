//! Container engine abstraction.
//!
//! Builds and runs talk to the engine only through the `ContainerEngine` trait:
//! - `DockerEngine`: local engine (or swarm manager) over its control socket
//!
//! The client is shared read-only between concurrent runs; every call is stateless.

use crate::config::RegistryCredentials;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

mod docker;
pub use docker::DockerEngine;

/// Host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl BindMount {
    /// Engine bind syntax: `host:container[:ro]`.
    pub fn to_bind_string(&self) -> String {
        let mut bind = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub binds: Vec<BindMount>,
    pub privileged: bool,
    pub labels: BTreeMap<String, String>,
}

/// Point-in-time container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited(i64),
    /// The engine no longer knows the container.
    Missing,
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One decoded line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
}

impl LogLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self { source: LogSource::Stdout, text: text.into() }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self { source: LogSource::Stderr, text: text.into() }
    }
}

/// Cumulative resource counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Total CPU time consumed by the container (ns)
    pub cpu_total: u64,
    /// Total CPU time of the host (ns)
    pub system_cpu: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub blk_read: u64,
    pub blk_write: u64,
}

/// Stream of decoded log lines; ends when the container's output closes.
pub type LogStream = BoxStream<'static, Result<LogLine>>;

/// Container engine trait.
///
/// Implementations map "container does not exist" to
/// [`CapsuleError::ContainerNotFound`](crate::error::CapsuleError::ContainerNotFound)
/// so callers can treat vanished containers as already gone.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn container_status(&self, id: &str) -> Result<ContainerStatus>;

    /// Stop a container, waiting up to `timeout` before the engine kills it.
    /// Stopping an already-stopped container succeeds.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Follow the combined output of a container.
    async fn logs(&self, id: &str) -> Result<LogStream>;

    /// One stats sample, or `None` once the container is gone.
    async fn stats(&self, id: &str) -> Result<Option<StatsSnapshot>>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn push_image(&self, image: &str, credentials: Option<&RegistryCredentials>)
        -> Result<()>;

    /// Engine name (for logging/metrics).
    fn name(&self) -> &str;
}

/// Splits raw output chunks into lines, carrying partial lines per stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line completed by it.
    pub fn push(&mut self, source: LogSource, chunk: &[u8]) -> Vec<LogLine> {
        let buffer = match source {
            LogSource::Stdout => &mut self.stdout,
            LogSource::Stderr => &mut self.stderr,
        };
        buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            lines.push(LogLine { source, text: decode_line(&raw[..raw.len() - 1]) });
        }
        lines
    }

    /// Flush unterminated trailing output.
    pub fn finish(&mut self) -> Vec<LogLine> {
        let mut lines = Vec::new();
        for (source, buffer) in
            [(LogSource::Stdout, &mut self.stdout), (LogSource::Stderr, &mut self.stderr)]
        {
            if !buffer.is_empty() {
                lines.push(LogLine { source, text: decode_line(buffer) });
                buffer.clear();
            }
        }
        lines
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}
