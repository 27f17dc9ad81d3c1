//! Builder backends.
//!
//! A backend runs the containerized build tool against a build context:
//! - `LocalEngineBackend`: helper container on the local engine
//! - `RemoteServiceBackend`: remote build service over HTTP
//! - `ClusterJobBackend`: single-attempt cluster batch job
//!
//! The backend is chosen once at startup by [`BackendFactory`].

use crate::builder::context::BuildContext;
use crate::error::Result;
use crate::types::{CachedImageRecord, CANCELLED_EXIT_STATUS};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod cluster;
pub mod factory;
pub mod local;
pub mod remote;

pub use cluster::ClusterJobBackend;
pub use factory::{BackendDeps, BackendFactory};
pub use local::LocalEngineBackend;
pub use remote::RemoteServiceBackend;

/// Container path the build context is mounted at.
pub const CONTEXT_MOUNT: &str = "/context";

/// Engine control socket path inside build containers.
pub const ENGINE_SOCKET_MOUNT: &str = "/var/run/docker.sock";

/// One invocation of the build tool.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub context: &'a BuildContext,
    /// Image reference to produce (a placeholder for dry runs)
    pub image: &'a str,
}

/// Result of one build tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRun {
    /// Tool exit status, or [`CANCELLED_EXIT_STATUS`]
    pub exit_status: i64,
    /// Digest over the tool output
    pub output_digest: String,
}

impl BuildRun {
    pub fn cancelled() -> Self {
        Self { exit_status: CANCELLED_EXIT_STATUS, output_digest: String::new() }
    }

    pub fn is_cancelled(&self) -> bool {
        self.exit_status == CANCELLED_EXIT_STATUS
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Builder backend trait.
#[async_trait]
pub trait BuilderBackend: Send + Sync {
    /// Run the build tool. With `dry_run` the tool only reports what it would do;
    /// its output is hashed but not surfaced as progress.
    ///
    /// Cancellation is reported as `exit_status == CANCELLED_EXIT_STATUS`.
    async fn run(
        &self,
        request: &BuildRequest<'_>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BuildRun>;

    /// Push a built image to the registry.
    async fn push(&self, image: &str) -> Result<()>;

    /// Make the build tool image available.
    async fn pull_builder_tool(&self) -> Result<()>;

    /// Look up an image in the registry.
    async fn probe_cache(&self, image: &str) -> Result<Option<CachedImageRecord>>;

    /// Backend name (for logging/metrics).
    fn name(&self) -> &str;
}

/// Build tool command line.
///
/// `push` asks the tool to push the result itself (used where the built image
/// lives on a node this process cannot reach).
pub fn build_command(
    program: &str,
    request: &BuildRequest<'_>,
    dry_run: bool,
    push: bool,
) -> Vec<String> {
    let descriptor = request.context.descriptor();
    let mut cmd = vec![
        program.to_string(),
        "--no-run".to_string(),
        "--user-id".to_string(),
        descriptor.uid.to_string(),
        "--user-name".to_string(),
        descriptor.user.clone(),
        "--target-repo-dir".to_string(),
        descriptor.target_repo_dir(),
        "--image-name".to_string(),
        request.image.to_string(),
    ];
    if dry_run {
        cmd.push("--no-build".to_string());
    } else if push {
        cmd.push("--push".to_string());
    }
    cmd.push(CONTEXT_MOUNT.to_string());
    cmd
}
