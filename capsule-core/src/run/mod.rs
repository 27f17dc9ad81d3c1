//! Recorded runs: execution, teardown, sampling and the reconcile sweep.

pub mod cleaner;
pub mod executor;
pub mod reconcile;
pub mod sampler;

pub use cleaner::{CleanupReason, CleanupReport, RunCleaner};
pub use executor::{ExecutorSettings, RunExecutor, RunImage, RunSpec, WORKSPACE_MOUNT};
pub use reconcile::{ReconcileReport, RunReconciler};
pub use sampler::{format_sample, ResourceSampler};

use std::collections::HashSet;
use tokio::sync::Mutex;

/// Run ids currently owned by an executor in this process.
#[derive(Debug, Default)]
pub struct InFlightRuns {
    runs: Mutex<HashSet<String>>,
}

impl InFlightRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a run id; false when it is already claimed.
    pub async fn insert(&self, run_id: &str) -> bool {
        self.runs.lock().await.insert(run_id.to_string())
    }

    pub async fn remove(&self, run_id: &str) {
        self.runs.lock().await.remove(run_id);
    }

    pub async fn contains(&self, run_id: &str) -> bool {
        self.runs.lock().await.contains(run_id)
    }
}
