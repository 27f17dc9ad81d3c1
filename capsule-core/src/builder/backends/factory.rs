//! Backend factory for deployment-mode selection.
//!
//! The deployment mode is resolved once from configuration at startup; the
//! resulting backend is shared for the life of the process.

use super::{BuilderBackend, ClusterJobBackend, LocalEngineBackend, RemoteServiceBackend};
use crate::cluster::{ClusterApi, KubectlCluster};
use crate::config::{Config, DeploymentMode};
use crate::engine::ContainerEngine;
use crate::error::{CapsuleError, Result};
use crate::registry::RegistryProbe;
use crate::upstream::ProgressSink;
use std::sync::Arc;
use tracing::{info, instrument};

/// Collaborators a backend may need.
#[derive(Clone)]
pub struct BackendDeps {
    /// Container engine (required for local deployments)
    pub engine: Option<Arc<dyn ContainerEngine>>,
    /// Cluster access; `kubectl` from configuration when unset
    pub cluster: Option<Arc<dyn ClusterApi>>,
    pub registry: Arc<RegistryProbe>,
    pub progress: Arc<dyn ProgressSink>,
}

/// Factory for creating builder backends.
pub struct BackendFactory;

impl BackendFactory {
    /// Create the backend for the configured deployment mode.
    ///
    /// - `Local` → LocalEngineBackend (requires `deps.engine`)
    /// - `Remote` → RemoteServiceBackend (requires `builder_url`)
    /// - `Cluster` → ClusterJobBackend
    #[instrument(skip_all, fields(mode = %config.deployment_mode))]
    pub fn create(config: &Config, deps: BackendDeps) -> Result<Arc<dyn BuilderBackend>> {
        let backend: Arc<dyn BuilderBackend> = match config.deployment_mode {
            DeploymentMode::Local => {
                let engine = deps.engine.ok_or_else(|| CapsuleError::InvalidConfig {
                    reason: "local deployment requires a container engine".to_string(),
                })?;
                Arc::new(LocalEngineBackend::new(
                    engine,
                    deps.registry,
                    deps.progress,
                    &config.builder_image,
                    &config.builder_program,
                    &config.docker_socket,
                    config.registry_credentials(),
                    config.stop_timeout(),
                ))
            }
            DeploymentMode::Remote => {
                let url = config.builder_url.as_deref().ok_or_else(|| {
                    CapsuleError::InvalidConfig {
                        reason: "remote deployment requires CAPSULE_BUILDER_URL".to_string(),
                    }
                })?;
                Arc::new(RemoteServiceBackend::new(url, deps.registry, deps.progress)?)
            }
            DeploymentMode::Cluster => {
                let cluster: Arc<dyn ClusterApi> = match deps.cluster {
                    Some(cluster) => cluster,
                    None => Arc::new(KubectlCluster::new(
                        &config.kubectl_path,
                        &config.cluster_namespace,
                    )),
                };
                Arc::new(ClusterJobBackend::new(
                    cluster,
                    deps.registry,
                    deps.progress,
                    &config.builder_image,
                    &config.builder_program,
                    &config.docker_socket,
                    config.poll_interval(),
                    config.drain_timeout(),
                ))
            }
        };

        info!(backend = backend.name(), "Builder backend selected");
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::TracingProgress;

    fn deps() -> BackendDeps {
        BackendDeps {
            engine: None,
            cluster: None,
            registry: Arc::new(RegistryProbe::new("http://registry.local", None).unwrap()),
            progress: Arc::new(TracingProgress),
        }
    }

    #[test]
    fn test_local_requires_engine() {
        let config = Config::default();
        let err = BackendFactory::create(&config, deps()).err().unwrap();
        assert!(matches!(err, CapsuleError::InvalidConfig { .. }));
    }

    #[test]
    fn test_remote_backend_selected() {
        let config = Config {
            deployment_mode: DeploymentMode::Remote,
            builder_url: Some("http://builder:8080".to_string()),
            ..Default::default()
        };
        let backend = BackendFactory::create(&config, deps()).unwrap();
        assert_eq!(backend.name(), "remote");
    }

    #[test]
    fn test_cluster_backend_selected() {
        let config = Config { deployment_mode: DeploymentMode::Cluster, ..Default::default() };
        let backend = BackendFactory::create(&config, deps()).unwrap();
        assert_eq!(backend.name(), "cluster");
    }
}
