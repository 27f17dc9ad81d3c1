//! Integration tests for run teardown, abandoned-run cleanup and the reconcile sweep.

mod common;

use capsule_core::catalog::{InMemoryCatalog, RunCatalog};
use capsule_core::config::{Config, DeploymentMode};
use capsule_core::error::CapsuleError;
use capsule_core::mount::{LocalMountManager, MountManager};
use capsule_core::run::{
    CleanupReason, InFlightRuns, RunCleaner, RunImage, RunReconciler, RunSpec,
};
use capsule_core::runtime::{Capsule, Collaborators};
use capsule_core::types::{RunRecord, RunResources, RunState};
use common::{Behavior, MockEngine, RecordingNotifier};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    engine: Arc<MockEngine>,
    catalog: Arc<InMemoryCatalog>,
    mounts: Arc<LocalMountManager>,
    notifier: Arc<RecordingNotifier>,
    cleaner: Arc<RunCleaner>,
    _runs_dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let runs_dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new(|_| Behavior::runs_forever()));
        let catalog = Arc::new(InMemoryCatalog::new());
        let mounts = Arc::new(LocalMountManager::new(runs_dir.path()));
        let notifier = Arc::new(RecordingNotifier::default());
        let cleaner = Arc::new(RunCleaner::new(
            engine.clone(),
            mounts.clone(),
            catalog.clone(),
            notifier.clone(),
            Duration::from_secs(1),
        ));
        Self { engine, catalog, mounts, notifier, cleaner, _runs_dir: runs_dir }
    }

    async fn add_run(
        &self,
        id: &str,
        state: RunState,
        container: Option<&str>,
        job: Option<&str>,
    ) {
        let resources = RunResources { container_id: container.map(str::to_string), mount: None };
        let job_id = job.map(str::to_string);
        self.catalog.insert(RunRecord { id: id.to_string(), state, resources, job_id }).await;
    }
}

#[tokio::test]
async fn test_second_cleanup_is_a_noop() {
    let fixture = Fixture::new();
    fixture.engine.insert_running("c1");
    fixture.add_run("run-1", RunState::Running, Some("c1"), None).await;
    let mut resources = RunResources { container_id: Some("c1".to_string()), mount: None };

    let first = fixture.cleaner.cleanup("run-1", &mut resources, CleanupReason::Finished).await;
    assert!(first.container_stopped);
    assert!(first.container_removed);
    assert!(first.errors.is_empty(), "{:?}", first.errors);
    assert!(resources.is_empty());

    let second = fixture.cleaner.cleanup("run-1", &mut resources, CleanupReason::Finished).await;
    assert!(second.is_noop());
    assert_eq!(fixture.engine.count("stop"), 1);
    assert_eq!(fixture.engine.count("remove"), 1);
}

#[tokio::test]
async fn test_cleanup_tolerates_missing_container() {
    let fixture = Fixture::new();
    fixture.add_run("run-1", RunState::Running, Some("gone"), None).await;
    let mut resources = RunResources { container_id: Some("gone".to_string()), mount: None };

    let report = fixture.cleaner.cleanup("run-1", &mut resources, CleanupReason::Finished).await;

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(!report.container_removed);
    assert_eq!(fixture.engine.count("remove"), 0);
}

#[tokio::test]
async fn test_cancelled_cleanup_persists_cancelled() {
    let fixture = Fixture::new();
    fixture.engine.insert_running("c1");
    fixture.add_run("run-1", RunState::Running, Some("c1"), None).await;
    let mount = fixture.mounts.acquire("run-1", None).await.unwrap();
    let mut resources = RunResources { container_id: Some("c1".to_string()), mount: Some(mount) };

    let report = fixture.cleaner.cleanup("run-1", &mut resources, CleanupReason::Cancelled).await;

    assert_eq!(report.state_persisted, Some(RunState::Cancelled));
    assert!(report.mount_released);
    assert_eq!(fixture.mounts.active_count().await, 0);
    let record = fixture.catalog.get_run("run-1").await.unwrap().unwrap();
    assert_eq!(record.state, RunState::Cancelled);
    assert!(record.resources.is_empty());
}

#[tokio::test]
async fn test_abandoned_run_is_failed_and_reported() {
    let fixture = Fixture::new();
    fixture.add_run("run-1", RunState::Running, None, Some("job-7")).await;
    let mut resources = RunResources::default();
    let reason = CleanupReason::Abandoned { job_id: Some("job-7".to_string()) };

    let report = fixture.cleaner.cleanup("run-1", &mut resources, reason).await;

    assert_eq!(report.state_persisted, Some(RunState::Failed));
    assert!(report.job_notified);
    let failed = fixture.notifier.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "job-7");
    assert!(failed[0].1.contains("run-1"));
}

#[tokio::test]
async fn test_reconcile_fails_only_dead_runs() {
    let fixture = Fixture::new();
    let in_flight = Arc::new(InFlightRuns::new());
    fixture.engine.insert_running("c2");
    fixture.add_run("alive", RunState::Running, Some("c2"), None).await;
    fixture.add_run("dead", RunState::Running, Some("c9"), Some("job-9")).await;
    fixture.add_run("mine", RunState::Starting, None, None).await;
    fixture.add_run("done", RunState::Completed, None, None).await;
    in_flight.insert("mine").await;

    let reconciler = RunReconciler::new(
        fixture.engine.clone(),
        fixture.catalog.clone(),
        fixture.cleaner.clone(),
        in_flight,
    );
    let report = reconciler.reconcile().await.unwrap();

    assert_eq!(report.examined, 3);
    assert_eq!(report.abandoned, vec!["dead".to_string()]);
    assert_eq!(report.alive, vec!["alive".to_string(), "mine".to_string()]);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let dead = fixture.catalog.get_run("dead").await.unwrap().unwrap();
    assert_eq!(dead.state, RunState::Failed);
    assert_eq!(fixture.notifier.failed()[0].0, "job-9");
    assert_eq!(fixture.engine.count("remove"), 0);
}

fn capsule(data_dir: &TempDir, fixture: &Fixture) -> Capsule {
    let config = Config {
        deployment_mode: DeploymentMode::Local,
        data_dir: data_dir.path().to_string_lossy().to_string(),
        ..Default::default()
    };
    let collaborators = Collaborators {
        engine: Some(fixture.engine.clone()),
        catalog: Some(fixture.catalog.clone()),
        notifier: Some(fixture.notifier.clone()),
        ..Default::default()
    };
    Capsule::with_collaborators(config, collaborators).unwrap()
}

#[tokio::test]
async fn test_cleanup_abandoned_run() {
    let fixture = Fixture::new();
    let data_dir = TempDir::new().unwrap();
    let capsule = capsule(&data_dir, &fixture);
    fixture.engine.insert_running("c1");
    fixture.add_run("run-1", RunState::Running, Some("c1"), Some("job-1")).await;

    let report = capsule.cleanup_abandoned_run("run-1").await.unwrap();

    assert!(report.container_removed);
    assert_eq!(report.state_persisted, Some(RunState::Failed));
    assert!(report.job_notified);
    assert!(fixture.engine.container_ids().is_empty());
}

#[tokio::test]
async fn test_cleanup_of_finished_or_unknown_run() {
    let fixture = Fixture::new();
    let data_dir = TempDir::new().unwrap();
    let capsule = capsule(&data_dir, &fixture);
    fixture.add_run("run-1", RunState::Completed, None, Some("job-1")).await;

    let report = capsule.cleanup_abandoned_run("run-1").await.unwrap();
    assert!(report.is_noop());
    assert!(fixture.notifier.failed().is_empty());

    let err = capsule.cleanup_abandoned_run("missing").await.unwrap_err();
    assert!(matches!(err, CapsuleError::CatalogError { .. }));
}

#[tokio::test]
async fn test_cleanup_refuses_run_executing_here() {
    let fixture = Fixture::new();
    let data_dir = TempDir::new().unwrap();
    let capsule = Arc::new(capsule(&data_dir, &fixture));
    let spec = RunSpec::new(
        "run-1",
        RunImage::Reference("registry.local/capsule/base:latest".to_string()),
        vec!["sleep".to_string(), "infinity".to_string()],
    );
    let cancel = CancellationToken::new();

    let runner = capsule.clone();
    let token = cancel.clone();
    let run = tokio::spawn(async move { runner.execute_run(&spec, &token).await });
    for _ in 0..200 {
        let record = fixture.catalog.get_run("run-1").await.unwrap();
        if record.map(|r| r.state) == Some(RunState::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = capsule.cleanup_abandoned_run("run-1").await.unwrap_err();
    assert!(matches!(err, CapsuleError::RunInProgress { .. }), "{:?}", err);
    assert_eq!(fixture.engine.count("stop"), 0);
    assert!(fixture.notifier.failed().is_empty());

    cancel.cancel();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.state, RunState::Cancelled);
}
