//! Configuration management.
//!
//! Configuration is layered: built-in defaults, then an optional JSON file, then
//! `CAPSULE_*` environment variables. The deployment mode is resolved once here and
//! never re-evaluated per call.

use crate::error::{CapsuleError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which builder backend the process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Local container engine (single host or swarm manager).
    Local,
    /// Remote build service reached over HTTP.
    Remote,
    /// Cluster batch jobs.
    Cluster,
}

impl DeploymentMode {
    /// Parse a deployment setting.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "docker" | "swarm" | "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "k8s" | "kubernetes" | "cluster" => Ok(Self::Cluster),
            other => Err(CapsuleError::InvalidConfig {
                reason: format!(
                    "Unknown deployment mode '{}'. Valid options: docker, swarm, remote, k8s",
                    other
                ),
            }),
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Persistent configuration for Capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub deployment_mode: DeploymentMode,

    /// Base URL of the image registry API (e.g. `https://registry.example.org`).
    pub registry_url: String,
    /// Repository prefix for built images (e.g. `registry.example.org/tale`).
    pub registry_prefix: String,
    pub registry_user: Option<String>,
    pub registry_password: Option<String>,

    /// Image providing the build tool.
    pub builder_image: String,
    /// Program invoked inside the builder image.
    pub builder_program: String,
    /// Remote build service URL (remote mode only).
    pub builder_url: Option<String>,

    pub docker_socket: String,
    pub cluster_namespace: String,
    pub kubectl_path: String,

    /// Catalog service base URL; an in-memory catalog is used when unset.
    pub catalog_url: Option<String>,
    pub catalog_token: Option<String>,

    pub data_dir: String,

    pub poll_interval_ms: u64,
    pub stats_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub log_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deployment_mode: DeploymentMode::Local,
            registry_url: "https://registry.local".to_string(),
            registry_prefix: "registry.local/capsule".to_string(),
            registry_user: None,
            registry_password: None,
            builder_image: "capsule/repo2docker:latest".to_string(),
            builder_program: "jupyter-repo2docker".to_string(),
            builder_url: None,
            docker_socket: "/var/run/docker.sock".to_string(),
            cluster_namespace: "default".to_string(),
            kubectl_path: "kubectl".to_string(),
            catalog_url: None,
            catalog_token: None,
            data_dir: paths::data_dir().to_string_lossy().to_string(),
            poll_interval_ms: 1000,
            stats_interval_secs: 5,
            stop_timeout_secs: 10,
            drain_timeout_secs: 10,
            log_queue_capacity: 4096,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        match std::env::var("CAPSULE_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => paths::config_dir().join("config.json"),
        }
    }

    /// Load configuration from disk and the environment, then validate it.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|e| CapsuleError::InvalidConfig {
                    reason: format!("Failed to read config {}: {}", path.display(), e),
                })?;
            serde_json::from_str(&content).map_err(|e| CapsuleError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CAPSULE_*` overrides from a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("CAPSULE_DEPLOYMENT") {
            self.deployment_mode = DeploymentMode::parse(&mode)?;
        }

        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };
        set(&mut self.registry_url, "CAPSULE_REGISTRY_URL");
        set(&mut self.registry_prefix, "CAPSULE_REGISTRY_PREFIX");
        set(&mut self.builder_image, "CAPSULE_BUILDER_IMAGE");
        set(&mut self.docker_socket, "CAPSULE_DOCKER_SOCKET");
        set(&mut self.cluster_namespace, "CAPSULE_K8S_NAMESPACE");
        set(&mut self.kubectl_path, "CAPSULE_KUBECTL");
        set(&mut self.data_dir, "CAPSULE_DATA_DIR");

        let set_opt = |target: &mut Option<String>, key: &str| {
            if let Some(value) = lookup(key) {
                *target = Some(value);
            }
        };
        set_opt(&mut self.registry_user, "CAPSULE_REGISTRY_USER");
        set_opt(&mut self.registry_password, "CAPSULE_REGISTRY_PASSWORD");
        set_opt(&mut self.builder_url, "CAPSULE_BUILDER_URL");
        set_opt(&mut self.catalog_url, "CAPSULE_CATALOG_URL");
        set_opt(&mut self.catalog_token, "CAPSULE_CATALOG_TOKEN");

        Ok(())
    }

    /// Reject configurations that cannot work. These errors are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.registry_user.is_some() && self.registry_password.is_none() {
            return Err(CapsuleError::MissingCredentials {
                reason: "CAPSULE_REGISTRY_USER is set but CAPSULE_REGISTRY_PASSWORD is not"
                    .to_string(),
            });
        }

        if self.deployment_mode == DeploymentMode::Remote && self.builder_url.is_none() {
            return Err(CapsuleError::InvalidConfig {
                reason: "remote deployment requires CAPSULE_BUILDER_URL".to_string(),
            });
        }

        if self.registry_prefix.trim().is_empty() {
            return Err(CapsuleError::InvalidConfig {
                reason: "registry prefix must not be empty".to_string(),
            });
        }

        if self.poll_interval_ms == 0 || self.stats_interval_secs == 0 {
            return Err(CapsuleError::InvalidConfig {
                reason: "poll and stats intervals must be positive".to_string(),
            });
        }

        if self.log_queue_capacity == 0 {
            return Err(CapsuleError::InvalidConfig {
                reason: "log queue capacity must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Registry basic-auth credentials, if configured.
    pub fn registry_credentials(&self) -> Option<RegistryCredentials> {
        match (&self.registry_user, &self.registry_password) {
            (Some(username), Some(password)) => Some(RegistryCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("runs")
    }

    /// Scratch space for build contexts.
    pub fn build_contexts_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("contexts")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Basic-auth credentials for the image registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
