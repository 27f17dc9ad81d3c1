//! Integration tests for builds driven through a helper container.

mod common;

use capsule_core::builder::{
    BuildContext, BuildContextAssembler, BuildRequest, BuilderBackend, LocalEngineBackend,
    LocalWorkspace,
};
use capsule_core::registry::RegistryProbe;
use capsule_core::types::EnvironmentDescriptor;
use common::{workspace, Behavior, MockEngine, RecordingProgress};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const BUILDER_IMAGE: &str = "capsule/builder:latest";
const IMAGE: &str = "registry.local/capsule/a:b";

fn context(ws: &TempDir) -> BuildContext {
    BuildContextAssembler::new()
        .assemble(
            &LocalWorkspace::new(ws.path()),
            &[],
            &EnvironmentDescriptor::new("PythonBuildPack", "jovyan"),
        )
        .unwrap()
}

fn backend(engine: Arc<MockEngine>, progress: Arc<RecordingProgress>) -> LocalEngineBackend {
    let registry = Arc::new(RegistryProbe::new("http://registry.invalid", None).unwrap());
    LocalEngineBackend::new(
        engine,
        registry,
        progress,
        BUILDER_IMAGE,
        "jupyter-repo2docker",
        "/var/run/docker.sock",
        None,
        Duration::from_secs(1),
    )
}

fn tool_output() -> Behavior {
    Behavior::exits(0)
        .with_stdout("Using PythonBuildPack builder")
        .with_stdout("Step 1/3 : FROM buildpack-deps:jammy")
        .with_stderr("debconf: delaying package configuration")
}

#[tokio::test]
async fn test_helper_output_is_hashed_and_reported() {
    let ws = workspace(&[("apt.txt", "vim")]);
    let ctx = context(&ws);
    let engine = Arc::new(MockEngine::new(|_| tool_output()));
    let progress = Arc::new(RecordingProgress::default());
    let backend = backend(engine.clone(), progress.clone());

    let request = BuildRequest { context: &ctx, image: IMAGE };
    let run = backend.run(&request, false, &CancellationToken::new()).await.unwrap();

    assert_eq!(run.exit_status, 0);
    assert_eq!(run.output_digest.len(), 64);
    assert_eq!(progress.messages().len(), 3);

    let spec = &engine.created_specs()[0];
    assert_eq!(spec.image, BUILDER_IMAGE);
    assert!(spec.privileged);
    assert!(spec.command.contains(&"--image-name".to_string()));
    assert!(spec.command.contains(&IMAGE.to_string()));
    let context_bind = spec.binds.iter().find(|b| b.container_path == "/context").unwrap();
    assert_eq!(context_bind.host_path, ctx.path());
    assert!(context_bind.read_only);

    // The helper is removed afterwards.
    assert!(engine.container_ids().is_empty());
}

#[tokio::test]
async fn test_dry_run_digest_ignores_local_repo_line() {
    let ws = workspace(&[("apt.txt", "vim")]);
    let ctx = context(&ws);
    let request = BuildRequest { context: &ctx, image: "capsule/dry-run:placeholder" };

    let first_engine = Arc::new(MockEngine::new(|_| {
        Behavior::exits(0).with_stdout("Using local repo /tmp/abc").with_stdout("plan")
    }));
    let second_engine = Arc::new(MockEngine::new(|_| {
        Behavior::exits(0).with_stdout("Using local repo /tmp/xyz").with_stdout("plan")
    }));
    let progress = Arc::new(RecordingProgress::default());

    let first = backend(first_engine.clone(), progress.clone())
        .run(&request, true, &CancellationToken::new())
        .await
        .unwrap();
    let second = backend(second_engine, Arc::default())
        .run(&request, true, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.output_digest, second.output_digest);
    assert!(progress.messages().is_empty());
    let spec = &first_engine.created_specs()[0];
    assert!(spec.command.contains(&"--no-build".to_string()));
}

#[tokio::test]
async fn test_tool_exit_status_passes_through() {
    let ws = workspace(&[("apt.txt", "vim")]);
    let ctx = context(&ws);
    let engine = Arc::new(MockEngine::new(|_| Behavior::exits(1).with_stderr("E: broken")));
    let backend = backend(engine.clone(), Arc::default());

    let request = BuildRequest { context: &ctx, image: IMAGE };
    let run = backend.run(&request, false, &CancellationToken::new()).await.unwrap();

    assert_eq!(run.exit_status, 1);
    assert_eq!(engine.count("remove"), 1);
}

#[tokio::test]
async fn test_cancellation_stops_helper() {
    let ws = workspace(&[("apt.txt", "vim")]);
    let ctx = context(&ws);
    let engine = Arc::new(MockEngine::new(|_| Behavior::runs_forever().with_stdout("Step 1")));
    let backend = backend(engine.clone(), Arc::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let request = BuildRequest { context: &ctx, image: IMAGE };
    let run = backend.run(&request, false, &cancel).await.unwrap();

    assert!(run.is_cancelled());
    assert_eq!(engine.count("stop"), 1);
    assert_eq!(engine.count("remove"), 1);
    assert!(engine.container_ids().is_empty());
}

#[tokio::test]
async fn test_push_and_pull_go_through_engine() {
    let engine = Arc::new(MockEngine::new(|_| Behavior::exits(0)));
    let backend = backend(engine.clone(), Arc::default());

    backend.pull_builder_tool().await.unwrap();
    backend.push(IMAGE).await.unwrap();

    assert_eq!(engine.calls(), vec![format!("pull:{}", BUILDER_IMAGE), format!("push:{}", IMAGE)]);
}
