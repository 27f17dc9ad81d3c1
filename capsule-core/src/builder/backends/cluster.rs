//! Cluster job backend.
//!
//! The build context travels as a config map; the build tool runs as a
//! single-attempt batch job that pushes the image itself. The job pod's log is
//! tailed in a background task while the job status is polled.

use super::{
    build_command, BuildRequest, BuildRun, BuilderBackend, CONTEXT_MOUNT, ENGINE_SOCKET_MOUNT,
};
use crate::builder::context::BuildContext;
use crate::builder::hash::OutputDigest;
use crate::cluster::{
    ClusterApi, ConfigMapSpec, ConfigMapVolume, HostPathVolume, JobSpec, JOB_LABEL,
};
use crate::error::{CapsuleError, Result};
use crate::observability::metrics;
use crate::registry::RegistryProbe;
use crate::types::CachedImageRecord;
use crate::upstream::ProgressSink;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

/// Exit status reported for a job whose pod failed.
const JOB_FAILED_STATUS: i64 = 1;

/// Builds images as cluster batch jobs.
pub struct ClusterJobBackend {
    cluster: Arc<dyn ClusterApi>,
    registry: Arc<RegistryProbe>,
    progress: Arc<dyn ProgressSink>,
    builder_image: String,
    builder_program: String,
    engine_socket: String,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl ClusterJobBackend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        registry: Arc<RegistryProbe>,
        progress: Arc<dyn ProgressSink>,
        builder_image: impl Into<String>,
        builder_program: impl Into<String>,
        engine_socket: impl Into<String>,
        poll_interval: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            registry,
            progress,
            builder_image: builder_image.into(),
            builder_program: builder_program.into(),
            engine_socket: engine_socket.into(),
            poll_interval,
            drain_timeout,
        }
    }

    fn job_spec(
        &self,
        name: &str,
        request: &BuildRequest<'_>,
        dry_run: bool,
        items: Vec<(String, String)>,
    ) -> JobSpec {
        let mut labels = BTreeMap::new();
        labels.insert(JOB_LABEL.to_string(), name.to_string());

        JobSpec {
            name: name.to_string(),
            image: self.builder_image.clone(),
            command: build_command(&self.builder_program, request, dry_run, true),
            config_map: Some(ConfigMapVolume {
                config_map: name.to_string(),
                mount_path: CONTEXT_MOUNT.to_string(),
                items,
            }),
            host_paths: vec![HostPathVolume {
                host_path: self.engine_socket.clone(),
                mount_path: ENGINE_SOCKET_MOUNT.to_string(),
            }],
            privileged: true,
            labels,
            ..Default::default()
        }
    }

    /// Submit the job and follow it to completion.
    async fn watch(
        &self,
        name: &str,
        job: &JobSpec,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        self.cluster.create_job(job).await?;
        info!(job = %name, "Build job submitted");

        let tail_token = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<String>(4096);
        let tail = tokio::spawn(tail_job_log(
            self.cluster.clone(),
            name.to_string(),
            tx,
            self.poll_interval,
            tail_token.clone(),
        ));

        let mut digest = OutputDigest::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(None),
                Some(line) = rx.recv() => self.record_line(&line, &mut digest, dry_run),
                _ = ticker.tick() => match self.cluster.job_status(name).await {
                    Ok(status) if status.failed > 0 => break Ok(Some(JOB_FAILED_STATUS)),
                    Ok(status) if status.succeeded > 0 => break Ok(Some(0)),
                    Ok(_) => {}
                    Err(e) => break Err(e),
                },
            }
        };

        let exit_status = match outcome {
            Ok(Some(exit_status)) => exit_status,
            Ok(None) => {
                info!(job = %name, "Build cancelled");
                tail_token.cancel();
                tail.abort();
                return Ok(BuildRun::cancelled());
            }
            Err(e) => {
                tail_token.cancel();
                tail.abort();
                return Err(e);
            }
        };

        // Pick up the tail of the log before hashing.
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(line) = rx.recv().await {
                self.record_line(&line, &mut digest, dry_run);
            }
        })
        .await;
        if drained.is_err() {
            warn!(job = %name, "Timed out draining job log");
        }
        tail_token.cancel();
        tail.abort();

        debug!(job = %name, exit_status, lines = digest.lines(), "Build job finished");
        Ok(BuildRun { exit_status, output_digest: digest.finish() })
    }

    fn record_line(&self, line: &str, digest: &mut OutputDigest, dry_run: bool) {
        digest.feed_line(line);
        if !dry_run {
            self.progress.report(line);
        }
    }

    /// Delete the job, its pod and the context config map.
    async fn delete_all(&self, name: &str) -> Result<()> {
        let mut failures = Vec::new();

        let pod = match self.cluster.job_pod(name).await {
            Ok(pod) => pod,
            Err(e) => {
                failures.push(format!("pod lookup: {}", e));
                None
            }
        };
        if let Err(e) = self.cluster.delete_job(name).await {
            failures.push(format!("job: {}", e));
        }
        if let Some(pod) = pod {
            if let Err(e) = self.cluster.delete_pod(&pod).await {
                failures.push(format!("pod {}: {}", pod, e));
            }
        }
        if let Err(e) = self.cluster.delete_config_map(name).await {
            failures.push(format!("config map: {}", e));
        }

        if failures.is_empty() {
            debug!(job = %name, "Build job resources deleted");
            Ok(())
        } else {
            metrics::record_cleanup_failure("cluster_job");
            Err(CapsuleError::ClusterCleanupFailed {
                job: name.to_string(),
                reason: failures.join("; "),
            })
        }
    }
}

/// Encode a build context as config map data plus key -> path items.
///
/// Config map keys cannot contain `/`, so files are keyed by position.
pub fn context_config_map(
    name: &str,
    context: &BuildContext,
) -> Result<(ConfigMapSpec, Vec<(String, String)>)> {
    let root = context.path();
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| CapsuleError::ContextError { reason: e.to_string() })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).map_err(CapsuleError::internal)?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = std::fs::read(entry.path()).map_err(|e| CapsuleError::io(entry.path(), e))?;
        files.push((relative, bytes));
    }

    let mut spec = ConfigMapSpec { name: name.to_string(), ..Default::default() };
    spec.labels.insert(JOB_LABEL.to_string(), name.to_string());
    let mut items = Vec::with_capacity(files.len());
    for (index, (path, bytes)) in files.into_iter().enumerate() {
        let key = format!("f{}", index);
        spec.binary_data.insert(key.clone(), bytes);
        items.push((key, path));
    }
    Ok((spec, items))
}

/// Follow the job pod's log until the pod has terminated or the token fires.
///
/// The pod may not exist or may not have started yet, and a log stream may end
/// or fail before the pod does. Either way the pod is looked up again every
/// `poll_interval`. `kubectl logs -f` replays from the start, so lines already
/// forwarded are skipped on reconnect.
async fn tail_job_log(
    cluster: Arc<dyn ClusterApi>,
    job: String,
    tx: mpsc::Sender<String>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    let mut forwarded = 0usize;
    loop {
        let pod = match cluster.job_pod(&job).await {
            Ok(pod) => pod,
            Err(e) => {
                debug!(job = %job, error = %e, "Pod lookup failed");
                None
            }
        };

        if let Some(pod) = pod {
            match cluster.pod_logs(&pod).await {
                Ok(mut stream) => {
                    let mut seen = 0usize;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            line = stream.next() => match line {
                                Some(Ok(line)) => {
                                    seen += 1;
                                    if seen <= forwarded {
                                        continue;
                                    }
                                    if tx.send(line.text).await.is_err() {
                                        return;
                                    }
                                    forwarded = seen;
                                }
                                Some(Err(e)) => {
                                    debug!(job = %job, pod = %pod, error = %e, "Log stream error");
                                    break;
                                }
                                None => break,
                            },
                        }
                    }
                }
                Err(e) => debug!(job = %job, pod = %pod, error = %e, "Failed to follow pod log"),
            }

            match cluster.pod_finished(&pod).await {
                Ok(true) => return,
                Ok(false) => debug!(job = %job, pod = %pod, "Log ended before pod finished"),
                Err(e) => debug!(job = %job, pod = %pod, error = %e, "Pod phase lookup failed"),
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[async_trait]
impl BuilderBackend for ClusterJobBackend {
    #[instrument(skip(self, request, cancel), fields(image = %request.image))]
    async fn run(
        &self,
        request: &BuildRequest<'_>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        if cancel.is_cancelled() {
            return Ok(BuildRun::cancelled());
        }

        let name = format!("capsule-build-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let (config_map, items) = context_config_map(&name, request.context)?;
        let job = self.job_spec(&name, request, dry_run, items);

        self.cluster.create_config_map(&config_map).await?;
        let result = self.watch(&name, &job, dry_run, cancel).await;
        let cleanup = self.delete_all(&name).await;

        match (result, cleanup) {
            (Ok(run), Ok(())) => Ok(run),
            (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                error!(job = %name, error = %cleanup_err, "Failed to delete build job resources");
                Err(e)
            }
        }
    }

    /// The job pushes the image itself.
    async fn push(&self, image: &str) -> Result<()> {
        debug!(image = %image, "Image pushed by the build job");
        Ok(())
    }

    /// Nodes pull the build tool image when the job is scheduled.
    async fn pull_builder_tool(&self) -> Result<()> {
        Ok(())
    }

    async fn probe_cache(&self, image: &str) -> Result<Option<CachedImageRecord>> {
        self.registry.probe(image).await
    }

    fn name(&self) -> &str {
        "cluster"
    }
}
