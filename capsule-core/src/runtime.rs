//! Startup composition.
//!
//! [`Capsule`] wires every component from a validated [`Config`]. The builder
//! backend is chosen here, once, and shared for the life of the process.

use crate::builder::{
    BackendDeps, BackendFactory, BuildContextAssembler, BuildOutcome, BuildSpec, ImageBuilder,
};
use crate::catalog::{HttpCatalog, InMemoryCatalog, RunCatalog};
use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::engine::{ContainerEngine, DockerEngine};
use crate::error::{CapsuleError, Result};
use crate::mount::{LocalMountManager, MountManager};
use crate::registry::RegistryProbe;
use crate::run::{
    CleanupReason, CleanupReport, ExecutorSettings, InFlightRuns, ReconcileReport, RunCleaner,
    RunExecutor, RunReconciler, RunSpec,
};
use crate::types::RunOutcome;
use crate::upstream::{JobNotifier, LoggingNotifier, ProgressSink, TracingProgress};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// External collaborators; anything left unset is created from configuration.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub engine: Option<Arc<dyn ContainerEngine>>,
    pub cluster: Option<Arc<dyn ClusterApi>>,
    pub catalog: Option<Arc<dyn RunCatalog>>,
    pub mounts: Option<Arc<dyn MountManager>>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub notifier: Option<Arc<dyn JobNotifier>>,
}

/// A fully wired Capsule instance.
pub struct Capsule {
    config: Config,
    builder: Arc<ImageBuilder>,
    executor: RunExecutor,
    cleaner: Arc<RunCleaner>,
    reconciler: RunReconciler,
    catalog: Arc<dyn RunCatalog>,
    in_flight: Arc<InFlightRuns>,
}

impl Capsule {
    /// Wire everything from configuration alone.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::default())
    }

    #[instrument(skip_all, fields(mode = %config.deployment_mode))]
    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let engine: Arc<dyn ContainerEngine> = match collaborators.engine {
            Some(engine) => engine,
            None => Arc::new(DockerEngine::connect(&config.docker_socket)?),
        };
        let catalog: Arc<dyn RunCatalog> = match (collaborators.catalog, &config.catalog_url) {
            (Some(catalog), _) => catalog,
            (None, Some(url)) => Arc::new(HttpCatalog::new(url, config.catalog_token.clone())?),
            (None, None) => Arc::new(InMemoryCatalog::new()),
        };
        let mounts: Arc<dyn MountManager> = match collaborators.mounts {
            Some(mounts) => mounts,
            None => Arc::new(LocalMountManager::new(config.runs_dir())),
        };
        let progress = collaborators.progress.unwrap_or_else(|| Arc::new(TracingProgress));
        let notifier = collaborators.notifier.unwrap_or_else(|| Arc::new(LoggingNotifier));

        let registry = Arc::new(RegistryProbe::new(
            &config.registry_url,
            config.registry_credentials(),
        )?);
        let backend = BackendFactory::create(
            &config,
            BackendDeps {
                engine: Some(engine.clone()),
                cluster: collaborators.cluster,
                registry,
                progress: progress.clone(),
            },
        )?;
        let assembler = BuildContextAssembler::with_scratch_dir(config.build_contexts_dir());
        let builder = Arc::new(ImageBuilder::new(backend, assembler, &config.registry_prefix));

        let in_flight = Arc::new(InFlightRuns::new());
        let cleaner = Arc::new(RunCleaner::new(
            engine.clone(),
            mounts.clone(),
            catalog.clone(),
            notifier,
            config.stop_timeout(),
        ));
        let executor = RunExecutor::new(
            engine.clone(),
            builder.clone(),
            mounts,
            catalog.clone(),
            cleaner.clone(),
            progress,
            in_flight.clone(),
            ExecutorSettings::from_config(&config),
        );
        let reconciler =
            RunReconciler::new(engine, catalog.clone(), cleaner.clone(), in_flight.clone());

        info!(
            backend = builder.backend().name(),
            registry = %config.registry_url,
            "Capsule initialized"
        );
        Ok(Self { config, builder, executor, cleaner, reconciler, catalog, in_flight })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn builder(&self) -> &Arc<ImageBuilder> {
        &self.builder
    }

    pub fn catalog(&self) -> &Arc<dyn RunCatalog> {
        &self.catalog
    }

    /// Build (or reuse) the image for a workspace.
    pub async fn build_image(
        &self,
        spec: &BuildSpec,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        self.builder.build(spec, cancel).await
    }

    /// Execute a recorded run.
    pub async fn execute_run(
        &self,
        spec: &RunSpec,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.executor.execute(spec, cancel).await
    }

    /// Out-of-band cleanup of a run nobody owns anymore: releases its resources,
    /// fails it and notifies the job system.
    ///
    /// A run this process is executing is refused with `RunInProgress`; the claim
    /// is held for the duration so the executor cannot pick the run up meanwhile.
    #[instrument(skip(self))]
    pub async fn cleanup_abandoned_run(&self, run_id: &str) -> Result<CleanupReport> {
        if !self.in_flight.insert(run_id).await {
            return Err(CapsuleError::RunInProgress { run_id: run_id.to_string() });
        }
        let result = self.cleanup_unowned_run(run_id).await;
        self.in_flight.remove(run_id).await;
        result
    }

    async fn cleanup_unowned_run(&self, run_id: &str) -> Result<CleanupReport> {
        let run = self.catalog.get_run(run_id).await?.ok_or_else(|| {
            CapsuleError::CatalogError { reason: format!("unknown run {}", run_id) }
        })?;
        if run.state.is_terminal() {
            info!(state = %run.state, "Run already finished");
            return Ok(CleanupReport::default());
        }
        let mut resources = run.resources.clone();
        let reason = CleanupReason::Abandoned { job_id: run.job_id.clone() };
        Ok(self.cleaner.cleanup(run_id, &mut resources, reason).await)
    }

    /// Fail every abandoned run in the catalog.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile().await
    }
}
