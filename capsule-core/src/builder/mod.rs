//! Image building for Capsule.
//!
//! This module assembles build contexts, derives content-addressed image tags,
//! and drives the configured builder backend with registry-backed caching.

pub mod backends;
pub mod context;
pub mod hash;
pub mod image;

pub use backends::{
    BackendDeps, BackendFactory, BuildRequest, BuildRun, BuilderBackend, ClusterJobBackend,
    LocalEngineBackend, RemoteServiceBackend,
};
pub use context::{BuildContext, BuildContextAssembler, LocalWorkspace, WorkspaceSource};
pub use hash::{hash_context, OutputDigest};
pub use image::{BuildOutcome, BuildSpec, ImageBuilder, DRY_RUN_IMAGE};
