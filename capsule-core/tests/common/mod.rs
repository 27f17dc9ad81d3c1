//! Shared mock adapters for integration tests.
//!
//! None of these talk to a real container engine, cluster or registry.

#![allow(dead_code)]

use async_trait::async_trait;
use capsule_core::builder::{BuildRequest, BuildRun, BuilderBackend};
use capsule_core::cluster::{ClusterApi, ConfigMapSpec, JobSpec, JobStatus};
use capsule_core::config::RegistryCredentials;
use capsule_core::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, LogLine, LogStream, StatsSnapshot,
};
use capsule_core::error::{CapsuleError, Result};
use capsule_core::types::CachedImageRecord;
use capsule_core::upstream::{JobNotifier, ProgressSink};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Exit code the mock engine reports for stopped containers.
pub const STOPPED_EXIT_CODE: i64 = 137;

/// How a mock container behaves once started.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub logs: Vec<LogLine>,
    /// `None` keeps the container running until it is stopped.
    pub exit: Option<i64>,
}

impl Behavior {
    pub fn exits(code: i64) -> Self {
        Self { logs: Vec::new(), exit: Some(code) }
    }

    pub fn runs_forever() -> Self {
        Self { logs: Vec::new(), exit: None }
    }

    pub fn with_stdout(mut self, text: &str) -> Self {
        self.logs.push(LogLine::stdout(text));
        self
    }

    pub fn with_stderr(mut self, text: &str) -> Self {
        self.logs.push(LogLine::stderr(text));
        self
    }
}

struct MockContainer {
    spec: ContainerSpec,
    behavior: Behavior,
    status: ContainerStatus,
    stopped: CancellationToken,
}

type BehaviorFn = dyn Fn(&ContainerSpec) -> Behavior + Send + Sync;

/// In-memory container engine.
pub struct MockEngine {
    behavior: Box<BehaviorFn>,
    containers: Mutex<HashMap<String, MockContainer>>,
    created: Mutex<Vec<ContainerSpec>>,
    calls: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
}

impl MockEngine {
    pub fn new(behavior: impl Fn(&ContainerSpec) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            behavior: Box::new(behavior),
            containers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Every call, formatted as `op:argument`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        self.containers.lock().unwrap().get(id).map(|c| c.spec.clone())
    }

    /// Specs of every container ever created, in creation order.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    /// Create a running container directly, bypassing `create_container`.
    pub fn insert_running(&self, id: &str) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            MockContainer {
                spec: ContainerSpec::default(),
                behavior: Behavior::runs_forever(),
                status: ContainerStatus::Running,
                stopped: CancellationToken::new(),
            },
        );
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn not_found(id: &str) -> CapsuleError {
        CapsuleError::ContainerNotFound { container: id.to_string() }
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("c{}", *next)
        };
        self.record(format!("create:{}", spec.image));
        self.created.lock().unwrap().push(spec.clone());
        let behavior = (self.behavior)(spec);
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                behavior,
                status: ContainerStatus::Created,
                stopped: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start:{}", id));
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.status = match container.behavior.exit {
            Some(code) => ContainerStatus::Exited(code),
            None => ContainerStatus::Running,
        };
        Ok(())
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        let containers = self.containers.lock().unwrap();
        Ok(containers.get(id).map(|c| c.status).unwrap_or(ContainerStatus::Missing))
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("stop:{}", id));
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if matches!(container.status, ContainerStatus::Running | ContainerStatus::Created) {
            container.status = ContainerStatus::Exited(STOPPED_EXIT_CODE);
        }
        container.stopped.cancel();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(format!("remove:{}", id));
        let mut containers = self.containers.lock().unwrap();
        let container = containers.remove(id).ok_or_else(|| Self::not_found(id))?;
        container.stopped.cancel();
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<LogStream> {
        let (lines, stopped, finite) = {
            let containers = self.containers.lock().unwrap();
            let container = containers.get(id).ok_or_else(|| Self::not_found(id))?;
            (
                container.behavior.logs.clone(),
                container.stopped.clone(),
                container.behavior.exit.is_some(),
            )
        };
        let head = stream::iter(lines.into_iter().map(Ok));
        if finite {
            return Ok(head.boxed());
        }
        let tail = stream::once(async move { stopped.cancelled().await })
            .filter_map(|_| async { None::<Result<LogLine>> });
        Ok(head.chain(tail).boxed())
    }

    async fn stats(&self, id: &str) -> Result<Option<StatsSnapshot>> {
        let containers = self.containers.lock().unwrap();
        match containers.get(id).map(|c| c.status) {
            Some(ContainerStatus::Running) => Ok(Some(StatsSnapshot {
                cpu_total: 1_000,
                system_cpu: 100_000,
                online_cpus: 2,
                memory_usage: 64 * 1024 * 1024,
                memory_limit: 1024 * 1024 * 1024,
                ..Default::default()
            })),
            _ => Ok(None),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record(format!("pull:{}", image));
        Ok(())
    }

    async fn push_image(
        &self,
        image: &str,
        _credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        self.record(format!("push:{}", image));
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// One recorded backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub image: String,
    pub dry_run: bool,
    pub context: PathBuf,
    pub files: Vec<String>,
}

/// Builder backend that simulates the build tool and a registry.
pub struct MockBackend {
    /// Exit status of real (non-dry-run) builds
    build_exit: i64,
    dry_run_exit: i64,
    /// Fired when a real build starts
    cancel_real_build: Option<CancellationToken>,
    calls: Mutex<Vec<BackendCall>>,
    registry: Mutex<HashMap<String, CachedImageRecord>>,
    pushes: Mutex<Vec<String>>,
    pulls: Mutex<usize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            build_exit: 0,
            dry_run_exit: 0,
            cancel_real_build: None,
            calls: Mutex::new(Vec::new()),
            registry: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
            pulls: Mutex::new(0),
        }
    }

    pub fn failing_build(exit: i64) -> Self {
        Self { build_exit: exit, ..Self::new() }
    }

    pub fn failing_dry_run(exit: i64) -> Self {
        Self { dry_run_exit: exit, ..Self::new() }
    }

    /// Cancel `token` as soon as a real build starts.
    pub fn cancelling(token: CancellationToken) -> Self {
        Self { cancel_real_build: Some(token), ..Self::new() }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn real_builds(&self) -> usize {
        self.calls().iter().filter(|c| !c.dry_run).count()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn pulls(&self) -> usize {
        *self.pulls.lock().unwrap()
    }

    /// Seed the simulated registry.
    pub fn preload(&self, image: &str) {
        self.registry.lock().unwrap().insert(image.to_string(), record_for(image));
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry record for an image reference.
pub fn record_for(image: &str) -> CachedImageRecord {
    let (repository, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
    CachedImageRecord {
        repository: repository.to_string(),
        tag: tag.to_string(),
        digest: format!("sha256:{:0>64}", tag.len()),
        created: None,
        labels: HashMap::new(),
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
    }
}

#[async_trait]
impl BuilderBackend for MockBackend {
    async fn run(
        &self,
        request: &BuildRequest<'_>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        self.calls.lock().unwrap().push(BackendCall {
            image: request.image.to_string(),
            dry_run,
            context: request.context.path().to_path_buf(),
            files: request.context.files().to_vec(),
        });

        if !dry_run {
            if let Some(token) = &self.cancel_real_build {
                token.cancel();
            }
        }
        if cancel.is_cancelled() {
            return Ok(BuildRun::cancelled());
        }

        // The simulated tool output only depends on the recipe files.
        let output = format!("plan: {}", request.context.files().join(","));
        let exit_status = if dry_run { self.dry_run_exit } else { self.build_exit };
        Ok(BuildRun { exit_status, output_digest: format!("{:x}", output.len() * 7919) })
    }

    async fn push(&self, image: &str) -> Result<()> {
        self.pushes.lock().unwrap().push(image.to_string());
        self.registry.lock().unwrap().insert(image.to_string(), record_for(image));
        Ok(())
    }

    async fn pull_builder_tool(&self) -> Result<()> {
        *self.pulls.lock().unwrap() += 1;
        Ok(())
    }

    async fn probe_cache(&self, image: &str) -> Result<Option<CachedImageRecord>> {
        Ok(self.registry.lock().unwrap().get(image).cloned())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// In-memory cluster with a scripted job lifecycle.
pub struct MockCluster {
    /// Polls before the job reports completion
    pub polls_until_done: u32,
    pub job_succeeds: bool,
    pub log_lines: Vec<String>,
    pub fail_delete_job: bool,
    /// Leading `pod_logs` calls that end without output, as for a pod still pending
    pub empty_log_follows: u32,
    polls: Mutex<u32>,
    log_follows: Mutex<u32>,
    config_maps: Mutex<Vec<ConfigMapSpec>>,
    jobs: Mutex<Vec<JobSpec>>,
    deleted: Mutex<Vec<String>>,
}

impl MockCluster {
    pub fn new(job_succeeds: bool) -> Self {
        Self {
            polls_until_done: 1,
            job_succeeds,
            log_lines: vec!["Step 1/2".to_string(), "Step 2/2".to_string()],
            fail_delete_job: false,
            empty_log_follows: 0,
            polls: Mutex::new(0),
            log_follows: Mutex::new(0),
            config_maps: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn log_follows(&self) -> u32 {
        *self.log_follows.lock().unwrap()
    }

    pub fn config_maps(&self) -> Vec<ConfigMapSpec> {
        self.config_maps.lock().unwrap().clone()
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        self.jobs.lock().unwrap().clone()
    }

    /// Deleted resources as `kind:name`.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn create_config_map(&self, spec: &ConfigMapSpec) -> Result<()> {
        self.config_maps.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        self.jobs.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn job_status(&self, _name: &str) -> Result<JobStatus> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        if *polls <= self.polls_until_done {
            return Ok(JobStatus { active: 1, ..Default::default() });
        }
        Ok(if self.job_succeeds {
            JobStatus { succeeded: 1, ..Default::default() }
        } else {
            JobStatus { failed: 1, ..Default::default() }
        })
    }

    async fn job_pod(&self, job: &str) -> Result<Option<String>> {
        Ok(Some(format!("{}-pod", job)))
    }

    async fn pod_logs(&self, _pod: &str) -> Result<LogStream> {
        let mut follows = self.log_follows.lock().unwrap();
        *follows += 1;
        if *follows <= self.empty_log_follows {
            return Ok(stream::empty().boxed());
        }
        let lines: Vec<Result<LogLine>> =
            self.log_lines.iter().map(|l| Ok(LogLine::stdout(l.clone()))).collect();
        Ok(stream::iter(lines).boxed())
    }

    async fn pod_finished(&self, _pod: &str) -> Result<bool> {
        Ok(*self.polls.lock().unwrap() > self.polls_until_done)
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        if self.fail_delete_job {
            return Err(CapsuleError::ClusterError { reason: "forbidden".to_string() });
        }
        self.deleted.lock().unwrap().push(format!("job:{}", name));
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(format!("pod:{}", name));
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(format!("configmap:{}", name));
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Progress sink that keeps every message.
#[derive(Default)]
pub struct RecordingProgress {
    messages: Mutex<Vec<String>>,
    panics: bool,
}

impl RecordingProgress {
    /// A sink that panics on the first message.
    pub fn panicking() -> Self {
        Self { panics: true, ..Default::default() }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, message: &str) {
        if self.panics {
            panic!("progress sink failed on {:?}", message);
        }
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Job notifier that keeps every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    failed: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn failed(&self) -> Vec<(String, String)> {
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobNotifier for RecordingNotifier {
    async fn job_failed(&self, job_id: &str, message: &str) -> Result<()> {
        self.failed.lock().unwrap().push((job_id.to_string(), message.to_string()));
        Ok(())
    }
}

/// Create a workspace directory holding `files`.
pub fn workspace(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (path, content) in files {
        write_file(dir.path(), path, content);
    }
    dir
}

pub fn write_file(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
