//! Local engine backend.
//!
//! Runs the build tool in a privileged helper container on the local engine:
//! - Context bind-mounted read-only at `/context`
//! - Engine control socket mounted so the tool can build and tag images
//! - Helper removed on every exit path

use super::{
    build_command, BuildRequest, BuildRun, BuilderBackend, CONTEXT_MOUNT, ENGINE_SOCKET_MOUNT,
};
use crate::builder::hash::OutputDigest;
use crate::config::RegistryCredentials;
use crate::engine::{BindMount, ContainerEngine, ContainerSpec, ContainerStatus};
use crate::error::{CapsuleError, Result};
use crate::observability::metrics;
use crate::registry::RegistryProbe;
use crate::types::CachedImageRecord;
use crate::upstream::ProgressSink;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How often the helper's exit status is polled once its output has closed.
const EXIT_POLL: Duration = Duration::from_millis(200);

/// Builds images with a helper container on the local engine.
pub struct LocalEngineBackend {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<RegistryProbe>,
    progress: Arc<dyn ProgressSink>,
    builder_image: String,
    builder_program: String,
    engine_socket: PathBuf,
    credentials: Option<RegistryCredentials>,
    stop_timeout: Duration,
}

impl LocalEngineBackend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<RegistryProbe>,
        progress: Arc<dyn ProgressSink>,
        builder_image: impl Into<String>,
        builder_program: impl Into<String>,
        engine_socket: impl Into<PathBuf>,
        credentials: Option<RegistryCredentials>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            progress,
            builder_image: builder_image.into(),
            builder_program: builder_program.into(),
            engine_socket: engine_socket.into(),
            credentials,
            stop_timeout,
        }
    }

    fn helper_spec(&self, request: &BuildRequest<'_>, dry_run: bool) -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert("capsule.io/role".to_string(), "builder".to_string());
        labels.insert("capsule.io/image".to_string(), request.image.to_string());

        ContainerSpec {
            name: Some(format!("capsule-build-{}", uuid::Uuid::new_v4().simple())),
            image: self.builder_image.clone(),
            command: build_command(&self.builder_program, request, dry_run, false),
            binds: vec![
                BindMount {
                    host_path: request.context.path().to_path_buf(),
                    container_path: CONTEXT_MOUNT.to_string(),
                    read_only: true,
                },
                BindMount {
                    host_path: self.engine_socket.clone(),
                    container_path: ENGINE_SOCKET_MOUNT.to_string(),
                    read_only: false,
                },
            ],
            privileged: true,
            labels,
            ..Default::default()
        }
    }

    /// Start the helper, stream its output and wait for it to exit.
    async fn drive(&self, id: &str, dry_run: bool, cancel: &CancellationToken) -> Result<BuildRun> {
        if cancel.is_cancelled() {
            return Ok(BuildRun::cancelled());
        }

        self.engine.start_container(id).await?;
        let mut logs = self.engine.logs(id).await?;
        let mut digest = OutputDigest::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancel_helper(id).await,
                line = logs.next() => match line {
                    Some(Ok(line)) => {
                        digest.feed_line(&line.text);
                        if !dry_run {
                            self.progress.report(&line.text);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        let exit_status = loop {
            match self.engine.container_status(id).await? {
                ContainerStatus::Exited(code) => break code,
                ContainerStatus::Missing => {
                    return Err(CapsuleError::ContainerNotFound { container: id.to_string() })
                }
                ContainerStatus::Created | ContainerStatus::Running => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancel_helper(id).await,
                _ = tokio::time::sleep(EXIT_POLL) => {}
            }
        };

        debug!(container_id = %id, exit_status, lines = digest.lines(), "Build helper exited");
        Ok(BuildRun { exit_status, output_digest: digest.finish() })
    }

    async fn cancel_helper(&self, id: &str) -> Result<BuildRun> {
        info!(container_id = %id, "Build cancelled, stopping helper");
        if let Err(e) = self.engine.stop_container(id, self.stop_timeout).await {
            if !e.is_not_found() {
                warn!(container_id = %id, error = %e, "Failed to stop build helper");
            }
        }
        Ok(BuildRun::cancelled())
    }
}

#[async_trait]
impl BuilderBackend for LocalEngineBackend {
    #[instrument(skip(self, request, cancel), fields(image = %request.image))]
    async fn run(
        &self,
        request: &BuildRequest<'_>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        let spec = self.helper_spec(request, dry_run);
        let id = self.engine.create_container(&spec).await?;

        let result = self.drive(&id, dry_run, cancel).await;

        if let Err(e) = self.engine.remove_container(&id).await {
            if !e.is_not_found() {
                warn!(container_id = %id, error = %e, "Failed to remove build helper");
                metrics::record_cleanup_failure("build_helper");
            }
        }

        result
    }

    async fn push(&self, image: &str) -> Result<()> {
        self.engine.push_image(image, self.credentials.as_ref()).await
    }

    async fn pull_builder_tool(&self) -> Result<()> {
        self.engine.pull_image(&self.builder_image).await
    }

    async fn probe_cache(&self, image: &str) -> Result<Option<CachedImageRecord>> {
        self.registry.probe(image).await
    }

    fn name(&self) -> &str {
        "local"
    }
}
