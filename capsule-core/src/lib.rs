//! Capsule Core Library
//!
//! Reproducible compute images and recorded container runs: content-addressed image
//! builds with registry caching across local, remote and cluster backends, and
//! supervised runs whose output and resource usage are captured next to the workspace.

pub mod builder;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod mount;
pub mod observability;
pub mod paths;
pub mod registry;
pub mod run;
pub mod runtime;
pub mod types;
pub mod upstream;

// Re-export commonly used items
pub use builder::{BuildOutcome, BuildSpec, ImageBuilder, LocalWorkspace, WorkspaceSource};
pub use catalog::{HttpCatalog, InMemoryCatalog, RunCatalog};
pub use config::{Config, DeploymentMode};
pub use error::{CapsuleError, Result};
pub use observability::init as init_observability;
pub use run::{CleanupReport, ReconcileReport, RunImage, RunSpec};
pub use runtime::{Capsule, Collaborators};
pub use types::{
    CachedImageRecord, EnvironmentDescriptor, ImageTag, RunOutcome, RunState,
    CANCELLED_EXIT_STATUS,
};
pub use upstream::{JobNotifier, ProgressSink};
