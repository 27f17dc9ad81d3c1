//! Run teardown.
//!
//! The cleaner releases whatever a run still holds: the container, the working
//! mount and its helper. It takes each handle out of [`RunResources`] before
//! releasing it, so a second cleanup of the same resources does nothing. Failures
//! are logged and collected, never raised.

use crate::catalog::RunCatalog;
use crate::engine::ContainerEngine;
use crate::error::CapsuleError;
use crate::mount::MountManager;
use crate::observability::metrics;
use crate::types::{RunResources, RunState};
use crate::upstream::JobNotifier;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Why a run is being cleaned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupReason {
    /// The executor finished the run and reports the terminal state itself.
    Finished,
    /// The run was cancelled; CANCELLED is persisted here.
    Cancelled,
    /// Nobody owns the run anymore; it is failed and the job system notified.
    Abandoned { job_id: Option<String> },
}

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub container_stopped: bool,
    pub container_removed: bool,
    pub mount_released: bool,
    pub helper_removed: bool,
    /// State written to the catalog, if any
    pub state_persisted: Option<RunState>,
    pub job_notified: bool,
    pub errors: Vec<String>,
}

impl CleanupReport {
    /// Nothing was released or persisted.
    pub fn is_noop(&self) -> bool {
        !self.container_stopped
            && !self.container_removed
            && !self.mount_released
            && !self.helper_removed
            && self.state_persisted.is_none()
            && !self.job_notified
    }

    fn failed(&mut self, resource: &str, error: &CapsuleError) {
        warn!(resource, error = %error, "Cleanup step failed");
        metrics::record_cleanup_failure(resource);
        self.errors.push(format!("{}: {}", resource, error));
    }
}

/// Releases run resources.
pub struct RunCleaner {
    engine: Arc<dyn ContainerEngine>,
    mounts: Arc<dyn MountManager>,
    catalog: Arc<dyn RunCatalog>,
    notifier: Arc<dyn JobNotifier>,
    stop_timeout: Duration,
}

impl RunCleaner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        mounts: Arc<dyn MountManager>,
        catalog: Arc<dyn RunCatalog>,
        notifier: Arc<dyn JobNotifier>,
        stop_timeout: Duration,
    ) -> Self {
        Self { engine, mounts, catalog, notifier, stop_timeout }
    }

    /// Release everything `resources` holds and apply `reason`.
    #[instrument(skip(self, resources), fields(reason = ?reason))]
    pub async fn cleanup(
        &self,
        run_id: &str,
        resources: &mut RunResources,
        reason: CleanupReason,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        let held = !resources.is_empty();

        if let Some(container_id) = resources.container_id.take() {
            self.remove_container(&container_id, "run_container", &mut report).await;
        }

        if let Some(mount) = resources.mount.take() {
            if let Some(helper_id) = &mount.helper_id {
                let mut helper = CleanupReport::default();
                self.remove_container(helper_id, "mount_helper", &mut helper).await;
                report.helper_removed = helper.container_removed;
                report.errors.extend(helper.errors);
            }
            match self.mounts.release(&mount).await {
                Ok(()) => report.mount_released = true,
                Err(e) => report.failed("mount", &e),
            }
        }

        if held {
            if let Err(e) = self.catalog.record_resources(run_id, resources).await {
                report.failed("catalog_resources", &e);
            }
        }

        match reason {
            CleanupReason::Finished => {}
            CleanupReason::Cancelled => {
                self.persist(run_id, RunState::Cancelled, &mut report).await;
            }
            CleanupReason::Abandoned { job_id } => {
                self.persist(run_id, RunState::Failed, &mut report).await;
                if let Some(job_id) = job_id {
                    let message = format!("run {} was abandoned and has been failed", run_id);
                    match self.notifier.job_failed(&job_id, &message).await {
                        Ok(()) => report.job_notified = true,
                        Err(e) => report.failed("job_notification", &e),
                    }
                }
            }
        }

        if report.is_noop() {
            debug!(run_id = %run_id, "Nothing to clean up");
        } else {
            info!(
                run_id = %run_id,
                container_removed = report.container_removed,
                mount_released = report.mount_released,
                errors = report.errors.len(),
                "Run cleaned up"
            );
        }
        report
    }

    /// Stop then remove a container; a container that is already gone is not an error.
    async fn remove_container(&self, id: &str, resource: &str, report: &mut CleanupReport) {
        match self.engine.stop_container(id, self.stop_timeout).await {
            Ok(()) => report.container_stopped = true,
            Err(e) if e.is_not_found() => {
                debug!(container = %id, "Container already gone");
                return;
            }
            Err(e) => report.failed(resource, &e),
        }

        match self.engine.remove_container(id).await {
            Ok(()) => report.container_removed = true,
            Err(e) if e.is_not_found() => {}
            Err(e) => report.failed(resource, &e),
        }
    }

    async fn persist(&self, run_id: &str, state: RunState, report: &mut CleanupReport) {
        match self.catalog.set_run_state(run_id, state).await {
            Ok(()) => report.state_persisted = Some(state),
            Err(e) => report.failed("catalog_state", &e),
        }
    }
}
