//! Docker engine adapter.
//!
//! Talks to the engine's control socket through bollard. Works against a single
//! host engine or a swarm manager; both expose the same container API.

use super::{
    ContainerEngine, ContainerSpec, ContainerStatus, LineDecoder, LogLine, LogSource, LogStream,
    StatsSnapshot,
};
use crate::config::RegistryCredentials;
use crate::error::{CapsuleError, Result};
use crate::types::ImageRef;
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, PushImageOptions};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

/// Request timeout for engine API calls (seconds).
const API_TIMEOUT_SECS: u64 = 120;

/// Buffered log lines between the engine reader and the consumer.
const LOG_BUFFER: usize = 256;

/// Container engine backed by a Docker-compatible daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the engine at a unix socket path.
    pub fn connect(socket_path: &str) -> Result<Self> {
        let docker =
            Docker::connect_with_socket(socket_path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| CapsuleError::EngineError {
                    reason: format!("Failed to connect to {}: {}", socket_path, e),
                })?;
        info!(socket = %socket_path, "Connected to container engine");
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Map a bollard error, turning 404s into `ContainerNotFound`.
fn map_err(container: &str, err: DockerError) -> CapsuleError {
    match err {
        DockerError::DockerResponseServerError { status_code: 404, .. } => {
            CapsuleError::ContainerNotFound { container: container.to_string() }
        }
        other => CapsuleError::EngineError { reason: other.to_string() },
    }
}

fn docker_credentials(
    registry: Option<&str>,
    credentials: Option<&RegistryCredentials>,
) -> Option<DockerCredentials> {
    credentials.map(|creds| DockerCredentials {
        username: Some(creds.username.clone()),
        password: Some(creds.password.clone()),
        serveraddress: registry.map(str::to_string),
        ..Default::default()
    })
}

/// Reduce an engine stats document to the counters the sampler records.
fn snapshot_from_stats(stats: &Stats) -> StatsSnapshot {
    let cpu = &stats.cpu_stats;
    let online_cpus = cpu
        .online_cpus
        .or_else(|| cpu.cpu_usage.percpu_usage.as_ref().map(|per_cpu| per_cpu.len() as u64))
        .unwrap_or(1);

    let (net_rx, net_tx) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks
                .values()
                .fold((0, 0), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes))
        })
        .unwrap_or((0, 0));

    let (blk_read, blk_write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0, 0), |(read, write), entry| {
                match entry.op.to_ascii_lowercase().as_str() {
                    "read" => (read + entry.value, write),
                    "write" => (read, write + entry.value),
                    _ => (read, write),
                }
            })
        })
        .unwrap_or((0, 0));

    StatsSnapshot {
        cpu_total: cpu.cpu_usage.total_usage,
        system_cpu: cpu.system_cpu_usage.unwrap_or(0),
        online_cpus,
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        net_rx,
        net_tx,
        blk_read,
        blk_write,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = spec
            .name
            .as_ref()
            .map(|name| CreateContainerOptions { name: name.clone(), platform: None });

        let binds: Vec<String> = spec.binds.iter().map(|b| b.to_bind_string()).collect();
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let labels: HashMap<String, String> =
            spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            entrypoint: spec.entrypoint.clone(),
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(binds),
                privileged: Some(spec.privileged),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| map_err(&spec.image, e))?;

        for warning in &response.warnings {
            warn!(container_id = %response.id, "Engine warning: {}", warning);
        }
        debug!(container_id = %response.id, "Container created");
        Ok(response.id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        let details = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details,
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                return Ok(ContainerStatus::Missing)
            }
            Err(e) => return Err(map_err(id, e)),
        };

        let Some(state) = details.state else {
            return Ok(ContainerStatus::Created);
        };

        let status = match state.status {
            Some(ContainerStateStatusEnum::RUNNING)
            | Some(ContainerStateStatusEnum::PAUSED)
            | Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::EXITED)
            | Some(ContainerStateStatusEnum::DEAD)
            | Some(ContainerStateStatusEnum::REMOVING) => {
                ContainerStatus::Exited(state.exit_code.unwrap_or(-1))
            }
            _ => ContainerStatus::Created,
        };
        Ok(status)
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions { t: timeout.as_secs() as i64 };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(map_err(id, e)),
        }
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions { force: true, ..Default::default() };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn logs(&self, id: &str) -> Result<LogStream> {
        let (tx, rx) = mpsc::channel::<Result<LogLine>>(LOG_BUFFER);
        let docker = self.docker.clone();
        let container = id.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut output = Box::pin(docker.logs(&container, Some(options)));
            let mut decoder = LineDecoder::new();

            while let Some(item) = output.next().await {
                let lines = match item {
                    Ok(LogOutput::StdErr { message }) => {
                        decoder.push(LogSource::Stderr, &message)
                    }
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        decoder.push(LogSource::Stdout, &message)
                    }
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        let _ = tx.send(Err(map_err(&container, e))).await;
                        return;
                    }
                };
                for line in lines {
                    if tx.send(Ok(line)).await.is_err() {
                        return;
                    }
                }
            }

            for line in decoder.finish() {
                if tx.send(Ok(line)).await.is_err() {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn stats(&self, id: &str) -> Result<Option<StatsSnapshot>> {
        let options = StatsOptions { stream: false, one_shot: false };
        let mut samples = Box::pin(self.docker.stats(id, Some(options)));
        match samples.next().await {
            Some(Ok(stats)) => Ok(Some(snapshot_from_stats(&stats))),
            Some(Err(DockerError::DockerResponseServerError { status_code: 404, .. })) | None => {
                Ok(None)
            }
            Some(Err(e)) => Err(map_err(id, e)),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions { from_image: image.to_string(), ..Default::default() };
        let mut progress = Box::pin(self.docker.create_image(Some(options), None, None));

        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| CapsuleError::EngineError {
                reason: format!("Failed to pull {}: {}", image, e),
            })?;
            if let Some(error) = info.error {
                return Err(CapsuleError::EngineError {
                    reason: format!("Failed to pull {}: {}", image, error),
                });
            }
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    #[instrument(skip(self, credentials))]
    async fn push_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        let reference = ImageRef::parse(image)?;
        let name = match &reference.registry {
            Some(registry) => format!("{}/{}", registry, reference.repository),
            None => reference.repository.clone(),
        };
        let options = PushImageOptions { tag: reference.tag.clone() };
        let auth = docker_credentials(reference.registry.as_deref(), credentials);

        let mut progress = Box::pin(self.docker.push_image(&name, Some(options), auth));
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| CapsuleError::RegistryError {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(error) = info.error {
                return Err(CapsuleError::RegistryError { image: image.to_string(), reason: error });
            }
        }

        info!(image = %image, "Image pushed");
        Ok(())
    }

    fn name(&self) -> &str {
        "docker"
    }
}
