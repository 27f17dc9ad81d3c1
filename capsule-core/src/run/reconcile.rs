//! Reconcile sweep for abandoned runs.
//!
//! A run is abandoned when the catalog still shows it STARTING or RUNNING but no
//! executor owns it and its container is not alive (for example after a crash).
//! Abandoned runs are torn down, failed, and reported to the job system.

use crate::catalog::RunCatalog;
use crate::engine::{ContainerEngine, ContainerStatus};
use crate::error::Result;
use crate::run::cleaner::{CleanupReason, RunCleaner};
use crate::run::InFlightRuns;
use crate::types::RunRecord;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active runs looked at
    pub examined: usize,
    /// Runs failed by this sweep
    pub abandoned: Vec<String>,
    /// Runs left alone because they are still alive
    pub alive: Vec<String>,
    pub errors: Vec<String>,
}

/// Finds and fails abandoned runs.
pub struct RunReconciler {
    engine: Arc<dyn ContainerEngine>,
    catalog: Arc<dyn RunCatalog>,
    cleaner: Arc<RunCleaner>,
    in_flight: Arc<InFlightRuns>,
}

impl RunReconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        catalog: Arc<dyn RunCatalog>,
        cleaner: Arc<RunCleaner>,
        in_flight: Arc<InFlightRuns>,
    ) -> Self {
        Self { engine, catalog, cleaner, in_flight }
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let runs = self.catalog.list_active_runs().await?;
        let mut report = ReconcileReport { examined: runs.len(), ..Default::default() };

        for run in runs {
            if self.in_flight.contains(&run.id).await {
                debug!(run_id = %run.id, "Run owned by this process");
                report.alive.push(run.id);
                continue;
            }

            match self.container_alive(&run).await {
                Ok(true) => report.alive.push(run.id),
                Ok(false) => {
                    let mut resources = run.resources.clone();
                    let reason = CleanupReason::Abandoned { job_id: run.job_id.clone() };
                    let cleanup = self.cleaner.cleanup(&run.id, &mut resources, reason).await;
                    report.errors.extend(cleanup.errors);
                    info!(run_id = %run.id, state = %run.state, "Abandoned run failed");
                    report.abandoned.push(run.id);
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Could not inspect run container");
                    report.errors.push(format!("{}: {}", run.id, e));
                }
            }
        }

        info!(
            examined = report.examined,
            abandoned = report.abandoned.len(),
            errors = report.errors.len(),
            "Reconcile sweep finished"
        );
        Ok(report)
    }

    async fn container_alive(&self, run: &RunRecord) -> Result<bool> {
        let Some(container_id) = &run.resources.container_id else {
            return Ok(false);
        };
        match self.engine.container_status(container_id).await {
            Ok(ContainerStatus::Created | ContainerStatus::Running) => Ok(true),
            Ok(ContainerStatus::Exited(_) | ContainerStatus::Missing) => Ok(false),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
