//! Recorded-run execution.
//!
//! ```text
//! STARTING ──[image, mount, container started]──> RUNNING ──[exit 0]──> COMPLETED
//!    │                                               └──[exit != 0, vanished]──> FAILED
//!    └──[error]──> FAILED
//! any non-terminal ──[cancelled]──> CANCELLED
//! ```
//!
//! While a run is RUNNING three tasks cooperate: the control loop (this module),
//! a log-drain task feeding a bounded channel, and the resource sampler. The
//! channel blocks the drain task when full so no output line is ever dropped.
//!
//! A run whose `execute` future is dropped (or that panics) is torn down on a
//! background task by its [`RunClaim`]: CANCELLED when the caller went away,
//! FAILED on a panic.

use crate::builder::{BuildOutcome, BuildSpec, ImageBuilder};
use crate::catalog::RunCatalog;
use crate::config::Config;
use crate::engine::{
    BindMount, ContainerEngine, ContainerSpec, ContainerStatus, LogLine, LogSource,
};
use crate::error::{CapsuleError, Result};
use crate::mount::MountManager;
use crate::observability::metrics;
use crate::run::cleaner::{CleanupReason, RunCleaner};
use crate::run::sampler::{ResourceSampler, RESOURCES_FILE};
use crate::run::InFlightRuns;
use crate::types::{
    RunMount, RunOutcome, RunResources, RunState, RunStatus, CANCELLED_EXIT_STATUS,
};
use crate::upstream::ProgressSink;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Mount point of the working mount inside the run container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Label carrying the run id on run containers.
pub const RUN_LABEL: &str = "capsule.io/run";

pub const STDOUT_FILE: &str = ".stdout";
pub const STDERR_FILE: &str = ".stderr";
pub const ENTRYPOINT_FILE: &str = ".entrypoint";

/// Exit status reported when the container disappeared without an exit code.
pub const VANISHED_EXIT_STATUS: i64 = -1;

/// Where the run image comes from.
#[derive(Clone)]
pub enum RunImage {
    /// A prebuilt image reference.
    Reference(String),
    /// Build (or reuse from the registry cache) before running.
    Build(BuildSpec),
}

/// A run request.
#[derive(Clone)]
pub struct RunSpec {
    pub run_id: String,
    pub image: RunImage,
    /// Command run in the container
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Directory seeding the working mount
    pub workspace: Option<PathBuf>,
}

impl RunSpec {
    pub fn new(run_id: impl Into<String>, image: RunImage, command: Vec<String>) -> Self {
        Self { run_id: run_id.into(), image, command, env: BTreeMap::new(), workspace: None }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Timing and queue settings of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub poll_interval: Duration,
    pub stats_interval: Duration,
    pub stop_timeout: Duration,
    pub drain_timeout: Duration,
    pub log_queue_capacity: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            stats_interval: config.stats_interval(),
            stop_timeout: config.stop_timeout(),
            drain_timeout: config.drain_timeout(),
            log_queue_capacity: config.log_queue_capacity.max(1),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Output captured from the run container.
#[derive(Debug, Default)]
struct RunArtifacts {
    stdout: String,
    stderr: String,
}

impl RunArtifacts {
    fn push(&mut self, line: LogLine) {
        let target = match line.source {
            LogSource::Stdout => &mut self.stdout,
            LogSource::Stderr => &mut self.stderr,
        };
        target.push_str(&line.text);
        target.push('\n');
    }

    async fn write(&self, dir: &Path, command: &[String]) -> Result<()> {
        let files = [
            (STDOUT_FILE, self.stdout.clone()),
            (STDERR_FILE, self.stderr.clone()),
            (ENTRYPOINT_FILE, format!("{}\n", command.join(" "))),
        ];
        for (name, content) in files {
            let path = dir.join(name);
            tokio::fs::write(&path, content).await.map_err(|e| CapsuleError::io(&path, e))?;
        }
        Ok(())
    }
}

/// State accumulated by one invocation.
#[derive(Default)]
struct RunProgress {
    status: RunStatus,
    resources: RunResources,
    artifacts: RunArtifacts,
    image: Option<String>,
}

/// How the supervised part of a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Exited(i64),
    Vanished,
    Cancelled,
}

/// An executor's claim on an in-flight run.
///
/// Mirrors the resources the run holds. Dropping an unreleased claim hands them
/// to the cleaner on a background task and gives the claim up afterwards.
struct RunClaim {
    run_id: String,
    in_flight: Arc<InFlightRuns>,
    cleaner: Arc<RunCleaner>,
    catalog: Arc<dyn RunCatalog>,
    resources: Mutex<RunResources>,
    started: Instant,
    /// Terminal state written if the claim is dropped unreleased
    interrupted: RunState,
    released: bool,
}

impl RunClaim {
    fn track(&self, resources: &RunResources) {
        *self.resources.lock().unwrap_or_else(|e| e.into_inner()) = resources.clone();
    }

    async fn release(mut self) {
        self.released = true;
        self.in_flight.remove(&self.run_id).await;
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let state = self.interrupted;
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                error!(run_id = %self.run_id, "Run interrupted outside a runtime, left claimed");
                return;
            }
        };
        warn!(run_id = %self.run_id, state = %state, "Run interrupted, tearing down");

        let run_id = self.run_id.clone();
        let in_flight = self.in_flight.clone();
        let cleaner = self.cleaner.clone();
        let catalog = self.catalog.clone();
        let mut resources =
            std::mem::take(&mut *self.resources.lock().unwrap_or_else(|e| e.into_inner()));
        let started = self.started;
        handle.spawn(async move {
            let finished = matches!(
                catalog.get_run(&run_id).await,
                Ok(Some(record)) if record.state.is_terminal()
            );
            let reason = if !finished && state == RunState::Cancelled {
                CleanupReason::Cancelled
            } else {
                CleanupReason::Finished
            };
            cleaner.cleanup(&run_id, &mut resources, reason).await;
            if !finished {
                if state == RunState::Failed {
                    if let Err(e) = catalog.set_run_state(&run_id, state).await {
                        warn!(run_id = %run_id, error = %e, "Failed to persist interrupted run");
                    }
                }
                metrics::record_run(state, started.elapsed().as_secs_f64());
            }
            in_flight.remove(&run_id).await;
        });
    }
}

/// Executes recorded runs.
pub struct RunExecutor {
    engine: Arc<dyn ContainerEngine>,
    builder: Arc<ImageBuilder>,
    mounts: Arc<dyn MountManager>,
    catalog: Arc<dyn RunCatalog>,
    cleaner: Arc<RunCleaner>,
    progress: Arc<dyn ProgressSink>,
    in_flight: Arc<InFlightRuns>,
    settings: ExecutorSettings,
}

impl RunExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        builder: Arc<ImageBuilder>,
        mounts: Arc<dyn MountManager>,
        catalog: Arc<dyn RunCatalog>,
        cleaner: Arc<RunCleaner>,
        progress: Arc<dyn ProgressSink>,
        in_flight: Arc<InFlightRuns>,
        settings: ExecutorSettings,
    ) -> Self {
        Self { engine, builder, mounts, catalog, cleaner, progress, in_flight, settings }
    }

    /// Execute a run to a terminal state.
    ///
    /// Container exit codes are reported in the outcome; `Err` means the run could
    /// not be carried out (it is recorded as FAILED). Resources are released on
    /// every path, including when this future is dropped before it completes.
    #[instrument(skip(self, spec, cancel), fields(run_id = %spec.run_id))]
    pub async fn execute(&self, spec: &RunSpec, cancel: &CancellationToken) -> Result<RunOutcome> {
        if !self.in_flight.insert(&spec.run_id).await {
            return Err(CapsuleError::RunInProgress { run_id: spec.run_id.clone() });
        }
        let mut claim = RunClaim {
            run_id: spec.run_id.clone(),
            in_flight: self.in_flight.clone(),
            cleaner: self.cleaner.clone(),
            catalog: self.catalog.clone(),
            resources: Mutex::new(RunResources::default()),
            started: Instant::now(),
            interrupted: RunState::Cancelled,
            released: false,
        };

        let run = AssertUnwindSafe(self.execute_in_flight(spec, &claim, cancel)).catch_unwind();
        match run.await {
            Ok(result) => {
                claim.release().await;
                result
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(reason = %reason, "Run panicked");
                claim.interrupted = RunState::Failed;
                drop(claim);
                Err(CapsuleError::Internal(format!("run {} panicked: {}", spec.run_id, reason)))
            }
        }
    }

    async fn execute_in_flight(
        &self,
        spec: &RunSpec,
        claim: &RunClaim,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.catalog.set_run_state(&spec.run_id, RunState::Starting).await?;
        info!(command = ?spec.command, "Run starting");

        let mut progress = RunProgress::default();
        let result = self.drive(spec, &mut progress, claim, cancel).await;

        let (state, exit_status, failure) = match result {
            Ok(Ending::Exited(0)) => (RunState::Completed, 0, None),
            Ok(Ending::Exited(code)) => (RunState::Failed, code, None),
            Ok(Ending::Vanished) => (RunState::Failed, VANISHED_EXIT_STATUS, None),
            Ok(Ending::Cancelled) => (RunState::Cancelled, CANCELLED_EXIT_STATUS, None),
            Err(e) if e.is_cancelled() => (RunState::Cancelled, CANCELLED_EXIT_STATUS, None),
            Err(e) => {
                error!(error = %e, "Run failed");
                (RunState::Failed, VANISHED_EXIT_STATUS, Some(e))
            }
        };

        let artifacts_dir = progress.resources.mount.as_ref().map(|m| m.host_path.clone());
        if let Some(dir) = &artifacts_dir {
            if let Err(e) = progress.artifacts.write(dir, &spec.command).await {
                warn!(error = %e, "Failed to write run artifacts");
            }
        }

        if let Err(e) = progress.status.advance(state) {
            warn!(error = %e, "Unexpected terminal transition");
        }

        let reason = match state {
            RunState::Cancelled => CleanupReason::Cancelled,
            _ => CleanupReason::Finished,
        };
        let report = self.cleaner.cleanup(&spec.run_id, &mut progress.resources, reason).await;
        claim.track(&progress.resources);

        let persisted = if state == RunState::Cancelled {
            match report.state_persisted {
                Some(RunState::Cancelled) => Ok(()),
                _ => Err(CapsuleError::CatalogError {
                    reason: format!("failed to persist cancellation of run {}", spec.run_id),
                }),
            }
        } else {
            self.catalog.set_run_state(&spec.run_id, state).await
        };

        metrics::record_run(state, claim.started.elapsed().as_secs_f64());
        info!(state = %state, exit_status, "Run finished");

        if let Some(e) = failure {
            return Err(e);
        }
        persisted?;
        Ok(RunOutcome {
            run_id: spec.run_id.clone(),
            state,
            exit_status,
            image: progress.image,
            artifacts_dir,
        })
    }

    /// STARTING through the end of supervision.
    async fn drive(
        &self,
        spec: &RunSpec,
        progress: &mut RunProgress,
        claim: &RunClaim,
        cancel: &CancellationToken,
    ) -> Result<Ending> {
        let image = match &spec.image {
            RunImage::Reference(reference) => reference.clone(),
            RunImage::Build(build) => match self.builder.build(build, cancel).await? {
                BuildOutcome::Cancelled => return Ok(Ending::Cancelled),
                outcome => outcome
                    .image()
                    .map(str::to_string)
                    .ok_or_else(|| CapsuleError::Internal("build produced no image".into()))?,
            },
        };
        progress.image = Some(image.clone());
        if cancel.is_cancelled() {
            return Ok(Ending::Cancelled);
        }

        let mount = self.mounts.acquire(&spec.run_id, spec.workspace.as_deref()).await?;
        progress.resources.mount = Some(mount.clone());
        self.record_resources(claim, &progress.resources).await;

        self.engine.pull_image(&image).await?;
        if cancel.is_cancelled() {
            return Ok(Ending::Cancelled);
        }

        let container_spec = self.container_spec(spec, &image, &mount);
        let container_id = self.engine.create_container(&container_spec).await?;
        progress.resources.container_id = Some(container_id.clone());
        self.record_resources(claim, &progress.resources).await;

        self.engine.start_container(&container_id).await?;
        progress.status.advance(RunState::Running)?;
        self.catalog.set_run_state(&spec.run_id, RunState::Running).await?;
        info!(container = %container_id, image = %image, "Run container started");

        self.supervise(&container_id, &mount, progress, cancel).await
    }

    fn container_spec(&self, spec: &RunSpec, image: &str, mount: &RunMount) -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert(RUN_LABEL.to_string(), spec.run_id.clone());
        ContainerSpec {
            name: Some(format!("capsule-run-{}", mount.id)),
            image: image.to_string(),
            command: spec.command.clone(),
            env: spec.env.clone(),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            binds: vec![BindMount {
                host_path: mount.host_path.clone(),
                container_path: WORKSPACE_MOUNT.to_string(),
                read_only: false,
            }],
            labels,
            ..Default::default()
        }
    }

    /// RUNNING: drain logs, sample resources and watch liveness until the container
    /// exits or cancellation is observed.
    async fn supervise(
        &self,
        container_id: &str,
        mount: &RunMount,
        progress: &mut RunProgress,
        cancel: &CancellationToken,
    ) -> Result<Ending> {
        let (tx, mut rx) = mpsc::channel::<LogLine>(self.settings.log_queue_capacity);
        let workers = CancellationToken::new();
        let _workers_guard = workers.clone().drop_guard();

        let log_task = tokio::spawn(drain_logs(
            self.engine.clone(),
            container_id.to_string(),
            tx,
            workers.clone(),
        ));
        let sampler = ResourceSampler::new(
            self.engine.clone(),
            container_id,
            mount.host_path.join(RESOURCES_FILE),
            self.settings.stats_interval,
        );
        let sampler_task = tokio::spawn(sampler.run(workers.clone()));

        let ending = loop {
            while let Ok(line) = rx.try_recv() {
                self.capture(progress, line);
            }

            if cancel.is_cancelled() {
                info!(container = %container_id, "Cancellation observed, stopping container");
                match self.engine.stop_container(container_id, self.settings.stop_timeout).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(error = %e, "Failed to stop cancelled run container"),
                }
                break Ending::Cancelled;
            }

            match self.engine.container_status(container_id).await {
                Ok(ContainerStatus::Exited(code)) => break Ending::Exited(code),
                Ok(ContainerStatus::Missing) => break Ending::Vanished,
                Ok(ContainerStatus::Created | ContainerStatus::Running) => {}
                Err(e) if e.is_not_found() => break Ending::Vanished,
                Err(e) => warn!(error = %e, "Container status check failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        };

        // The drain task drops its sender once the log stream ends.
        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            lines
        });
        match drained.await {
            Ok(lines) => lines.into_iter().for_each(|line| self.capture(progress, line)),
            Err(_) => warn!(container = %container_id, "Log drain timed out"),
        }

        workers.cancel();
        match tokio::time::timeout(self.settings.drain_timeout, sampler_task).await {
            Ok(Ok(Ok(samples))) => debug!(samples, "Resource sampler finished"),
            Ok(Ok(Err(e))) => warn!(error = %e, "Resource sampler failed"),
            Ok(Err(e)) => warn!(error = %e, "Resource sampler task failed"),
            Err(_) => warn!("Resource sampler did not stop in time"),
        }
        log_task.abort();
        while let Ok(line) = rx.try_recv() {
            self.capture(progress, line);
        }

        debug!(?ending, "Run supervision finished");
        Ok(ending)
    }

    fn capture(&self, progress: &mut RunProgress, line: LogLine) {
        self.progress.report(&line.text);
        progress.artifacts.push(line);
    }

    async fn record_resources(&self, claim: &RunClaim, resources: &RunResources) {
        claim.track(resources);
        if let Err(e) = self.catalog.record_resources(&claim.run_id, resources).await {
            warn!(run_id = %claim.run_id, error = %e, "Failed to record run resources");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forward container output into `tx` until the stream ends or `token` fires.
async fn drain_logs(
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
    tx: mpsc::Sender<LogLine>,
    token: CancellationToken,
) -> Result<usize> {
    let mut stream = engine.logs(&container_id).await?;
    let mut forwarded = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            Some(Err(e)) if e.is_not_found() => break,
            Some(Err(e)) => {
                warn!(container = %container_id, error = %e, "Log stream failed");
                break;
            }
            None => break,
        }
    }
    Ok(forwarded)
}
