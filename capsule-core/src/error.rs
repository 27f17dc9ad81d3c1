//! Error types for Capsule.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Capsule operations.
pub type Result<T> = std::result::Result<T, CapsuleError>;

/// Main error type for Capsule.
#[derive(Error, Debug)]
pub enum CapsuleError {
    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Missing credentials: {reason}")]
    MissingCredentials { reason: String },

    // Build errors
    #[error("Build failed for {image}: {reason}")]
    BuildFailed { image: String, reason: String },

    #[error("Dry run failed with exit status {exit_status}; the image tag cannot be computed")]
    DryRunFailed { exit_status: i64 },

    #[error("Build context error: {reason}")]
    ContextError { reason: String },

    // Registry errors
    #[error("Registry error for {image}: {reason}")]
    RegistryError { image: String, reason: String },

    #[error("Invalid image reference: {reference}")]
    InvalidImageRef { reference: String },

    // Engine errors
    #[error("Container not found: {container}")]
    ContainerNotFound { container: String },

    #[error("Container engine error: {reason}")]
    EngineError { reason: String },

    // Cluster errors
    #[error("Cluster error: {reason}")]
    ClusterError { reason: String },

    #[error("Failed to delete cluster resources for {job}: {reason}")]
    ClusterCleanupFailed { job: String, reason: String },

    // Remote builder errors
    #[error("Remote builder error: {reason}")]
    RemoteBuilderError { reason: String },

    // Run errors
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Working mount {mount_id} is already in use")]
    MountInUse { mount_id: String },

    #[error("Run {run_id} is already executing")]
    RunInProgress { run_id: String },

    // Catalog errors
    #[error("Catalog error: {reason}")]
    CatalogError { reason: String },

    /// Raised internally when an operation observes cancellation. Public entry
    /// points translate it into a cancelled outcome.
    #[error("Operation cancelled")]
    Cancelled,

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CapsuleError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Shorthand for an I/O error at a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// True when this error only signals cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the engine reported the container as already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound { .. })
    }
}
