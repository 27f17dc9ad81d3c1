//! Image build orchestration.
//!
//! ```text
//! assemble context ─> environment hash ─> dry run ─> ImageTag
//!                                                      │
//!                               registry hit (not forced) ──> Cached
//!                                                      │
//!                                 real build ─> push ─> re-probe ──> Built
//! ```
//!
//! One context directory serves both the dry run and the real build and is removed
//! when the build finishes.

use crate::builder::backends::{BuildRequest, BuilderBackend};
use crate::builder::context::{BuildContext, BuildContextAssembler, WorkspaceSource};
use crate::builder::hash::hash_context;
use crate::error::{CapsuleError, Result};
use crate::observability::metrics;
use crate::types::{CachedImageRecord, EnvironmentDescriptor, ImageTag};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Image name used for dry runs; never pushed.
pub const DRY_RUN_IMAGE: &str = "capsule/dry-run:placeholder";

/// What to build.
#[derive(Clone)]
pub struct BuildSpec {
    pub workspace: Arc<dyn WorkspaceSource>,
    /// Extra workspace paths, or `["*"]` for the whole workspace
    pub extras: Vec<String>,
    pub descriptor: EnvironmentDescriptor,
    /// Rebuild even when the registry already holds the tag
    pub force: bool,
}

/// Result of a build request.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// The registry already held the image.
    Cached { image: String, record: CachedImageRecord },
    /// The image was built and pushed.
    Built { image: String, record: CachedImageRecord },
    Cancelled,
}

impl BuildOutcome {
    /// Image reference, unless cancelled.
    pub fn image(&self) -> Option<&str> {
        match self {
            Self::Cached { image, .. } | Self::Built { image, .. } => Some(image),
            Self::Cancelled => None,
        }
    }

    pub fn record(&self) -> Option<&CachedImageRecord> {
        match self {
            Self::Cached { record, .. } | Self::Built { record, .. } => Some(record),
            Self::Cancelled => None,
        }
    }
}

/// Salt that makes a forced build produce a fresh environment hash.
fn force_token() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
        .to_string()
}

/// Builds content-addressed images through the configured backend.
pub struct ImageBuilder {
    backend: Arc<dyn BuilderBackend>,
    assembler: BuildContextAssembler,
    registry_prefix: String,
    builder_tool: OnceCell<()>,
}

impl ImageBuilder {
    pub fn new(
        backend: Arc<dyn BuilderBackend>,
        assembler: BuildContextAssembler,
        registry_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            assembler,
            registry_prefix: registry_prefix.into(),
            builder_tool: OnceCell::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BuilderBackend> {
        &self.backend
    }

    /// Assemble a context from a workspace and build it.
    #[instrument(skip_all, fields(force = spec.force, extras = spec.extras.len()))]
    pub async fn build(
        &self,
        spec: &BuildSpec,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        if cancel.is_cancelled() {
            return Ok(BuildOutcome::Cancelled);
        }

        let assembler = self.assembler.clone();
        let workspace = spec.workspace.clone();
        let extras = spec.extras.clone();
        let descriptor = spec.descriptor.clone();
        let context = tokio::task::spawn_blocking(move || {
            assembler.assemble(workspace.as_ref(), &extras, &descriptor)
        })
        .await
        .map_err(CapsuleError::internal)??;

        self.build_context(&context, spec.force, cancel).await
    }

    /// Compute the image tag of a context: environment hash plus dry-run digest.
    ///
    /// Returns `None` when the dry run was cancelled.
    #[instrument(skip(self, context, cancel))]
    pub async fn compute_tag(
        &self,
        context: &BuildContext,
        force_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<ImageTag>> {
        let path = context.path().to_path_buf();
        let token = force_token.map(str::to_string);
        let environment_hash =
            tokio::task::spawn_blocking(move || hash_context(&path, token.as_deref()))
                .await
                .map_err(CapsuleError::internal)??;

        self.ensure_builder_tool().await?;

        let request = BuildRequest { context, image: DRY_RUN_IMAGE };
        let dry_run = self.backend.run(&request, true, cancel).await?;
        if dry_run.is_cancelled() {
            return Ok(None);
        }
        if !dry_run.succeeded() {
            metrics::record_build_failure("dry_run");
            return Err(CapsuleError::DryRunFailed { exit_status: dry_run.exit_status });
        }

        let tag = ImageTag { environment_hash, output_hash: dry_run.output_digest };
        debug!(tag = %tag, "Computed image tag");
        Ok(Some(tag))
    }

    /// Build an assembled context, skipping the build on a registry hit.
    #[instrument(skip(self, context, cancel))]
    pub async fn build_context(
        &self,
        context: &BuildContext,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let started = Instant::now();
        let token = force.then(force_token);

        let Some(tag) = self.compute_tag(context, token.as_deref(), cancel).await? else {
            info!("Build cancelled during dry run");
            return Ok(BuildOutcome::Cancelled);
        };
        let image = tag.image_ref(&self.registry_prefix);

        if !force {
            if let Some(record) = self.backend.probe_cache(&image).await? {
                metrics::record_cache_hit();
                info!(image = %image, digest = %record.digest, "Cache hit, skipping build");
                return Ok(BuildOutcome::Cached { image, record });
            }
        }

        info!(image = %image, backend = self.backend.name(), "Building image");
        let request = BuildRequest { context, image: &image };
        let run = self.backend.run(&request, false, cancel).await?;
        if run.is_cancelled() {
            info!(image = %image, "Build cancelled");
            return Ok(BuildOutcome::Cancelled);
        }
        if !run.succeeded() {
            metrics::record_build_failure("build");
            return Err(CapsuleError::BuildFailed {
                image,
                reason: format!("build tool exited with status {}", run.exit_status),
            });
        }

        self.backend.push(&image).await?;
        let record = self.backend.probe_cache(&image).await?.ok_or_else(|| {
            CapsuleError::RegistryError {
                image: image.clone(),
                reason: "image not found in registry after push".to_string(),
            }
        })?;

        metrics::record_build(started.elapsed().as_secs_f64(), self.backend.name());
        info!(image = %image, digest = %record.digest, "Image built and pushed");
        Ok(BuildOutcome::Built { image, record })
    }

    /// Pull the build tool once per process.
    async fn ensure_builder_tool(&self) -> Result<()> {
        self.builder_tool
            .get_or_try_init(|| async {
                info!(backend = self.backend.name(), "Pulling build tool");
                self.backend.pull_builder_tool().await
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_tokens_differ() {
        let a = force_token();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_ne!(a, force_token());
    }

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(BuildOutcome::Cancelled.image(), None);
        let record = CachedImageRecord {
            repository: "capsule/abc".into(),
            tag: "def".into(),
            digest: "sha256:00".into(),
            created: None,
            labels: Default::default(),
            architecture: "amd64".into(),
            os: "linux".into(),
        };
        let outcome = BuildOutcome::Cached { image: "r/capsule/abc:def".into(), record };
        assert_eq!(outcome.image(), Some("r/capsule/abc:def"));
        assert_eq!(outcome.record().map(|r| r.digest.as_str()), Some("sha256:00"));
    }
}
