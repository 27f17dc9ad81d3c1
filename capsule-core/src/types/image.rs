//! Image domain types.

use crate::error::{CapsuleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Content-addressed image tag: `{environment-hash}:{recipe-output-hash}`.
///
/// The environment hash names the repository below the registry prefix and the
/// recipe-output hash is the tag, so the pushed reference is
/// `{prefix}/{environment_hash}:{output_hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageTag {
    /// Hash over the build context (plus the force token, if any)
    pub environment_hash: String,
    /// Hash over the dry-run transcript of the build tool
    pub output_hash: String,
}

impl ImageTag {
    /// Full image reference under a registry prefix.
    pub fn image_ref(&self, registry_prefix: &str) -> String {
        format!(
            "{}/{}:{}",
            registry_prefix.trim_end_matches('/'),
            self.environment_hash,
            self.output_hash
        )
    }
}

impl std::fmt::Display for ImageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.environment_hash, self.output_hash)
    }
}

/// A parsed `[registry/]repository:tag` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host (with optional port), if the reference names one
    pub registry: Option<String>,
    /// Repository path within the registry
    pub repository: String,
    /// Tag, `latest` when omitted
    pub tag: String,
}

impl ImageRef {
    /// Parse an image reference.
    ///
    /// The first path component is treated as a registry host when it contains a
    /// `.` or `:` or is `localhost`, matching the container engine's convention.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = || CapsuleError::InvalidImageRef { reference: reference.to_string() };

        if reference.is_empty()
            || reference.contains('@')
            || reference.contains(char::is_whitespace)
        {
            return Err(invalid());
        }

        // A ':' after the last '/' separates the tag; earlier ones belong to a port.
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match reference[last_slash..].rfind(':') {
            Some(pos) => {
                let split = last_slash + pos;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, "latest"),
        };

        if name.is_empty() || tag.is_empty() {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest.to_string())
            }
            _ => (None, name.to_string()),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid());
        }

        Ok(Self { registry, repository, tag: tag.to_string() })
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.registry {
            Some(registry) => write!(f, "{}/{}:{}", registry, self.repository, self.tag),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}

/// Read-only projection of an image that already exists in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedImageRecord {
    pub repository: String,
    pub tag: String,
    /// Manifest content digest (`sha256:...`)
    pub digest: String,
    pub created: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    pub architecture: String,
    pub os: String,
}

/// Environment descriptor synthesized into every build context.
///
/// Fields are declared in key order; the serialized form is hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Buildpack the build tool should use
    pub buildpack: String,
    /// Environment variables baked into the image (sorted for stable hashing)
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Numeric id of the effective user
    #[serde(default = "default_uid")]
    pub uid: u32,
    /// Effective user inside the container
    pub user: String,
}

fn default_uid() -> u32 {
    1000
}

impl EnvironmentDescriptor {
    pub fn new(buildpack: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            buildpack: buildpack.into(),
            environment: BTreeMap::new(),
            user: user.into(),
            uid: default_uid(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Container path where the user's workspace lives during the build.
    pub fn target_repo_dir(&self) -> String {
        format!("/home/{}/workspace", self.user)
    }
}
