//! Image registry cache probe.
//!
//! Looks up an image in a Docker v2 / OCI distribution registry and returns its
//! record, or `None` when the registry does not know it.

use crate::config::RegistryCredentials;
use crate::error::{CapsuleError, Result};
use crate::types::{CachedImageRecord, ImageRef};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// Manifest media types the probe accepts.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Image manifest (only the config descriptor is needed).
#[derive(Debug, Deserialize)]
struct Manifest {
    config: BlobDescriptor,
}

#[derive(Debug, Deserialize)]
struct BlobDescriptor {
    digest: String,
}

/// Image configuration blob.
#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    config: ContainerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels")]
    labels: Option<HashMap<String, String>>,
}

/// Registry probe over the distribution HTTP API.
#[derive(Debug, Clone)]
pub struct RegistryProbe {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<RegistryCredentials>,
}

impl RegistryProbe {
    /// Create a probe against a registry base URL (e.g. `https://registry.example.org`).
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<RegistryCredentials>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(CapsuleError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Look up an image reference.
    ///
    /// A 404 at any step means "not cached"; other failures are `RegistryError`.
    #[instrument(skip(self), fields(image = %image_ref))]
    pub async fn probe(&self, image_ref: &str) -> Result<Option<CachedImageRecord>> {
        let reference = ImageRef::parse(image_ref)?;
        let registry_err = |reason: String| CapsuleError::RegistryError {
            image: image_ref.to_string(),
            reason,
        };

        let manifest_url =
            format!("{}/v2/{}/manifests/{}", self.base_url, reference.repository, reference.tag);
        let Some(response) = self.get(&manifest_url, Some(MANIFEST_ACCEPT), image_ref).await?
        else {
            debug!("Manifest not found");
            return Ok(None);
        };

        let header_digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| registry_err(format!("Failed to read manifest: {}", e)))?;
        let digest = header_digest.unwrap_or_else(|| {
            let mut hasher = Sha256::new();
            hasher.update(&body);
            format!("sha256:{:x}", hasher.finalize())
        });

        let manifest: Manifest = serde_json::from_slice(&body)
            .map_err(|e| registry_err(format!("Invalid manifest: {}", e)))?;

        let blob_url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, reference.repository, manifest.config.digest
        );
        let Some(response) = self.get(&blob_url, None, image_ref).await? else {
            debug!(config = %manifest.config.digest, "Config blob not found");
            return Ok(None);
        };
        let config: ImageConfig = response
            .json()
            .await
            .map_err(|e| registry_err(format!("Invalid image config: {}", e)))?;

        debug!(digest = %digest, "Image found in registry");
        Ok(Some(CachedImageRecord {
            repository: reference.repository,
            tag: reference.tag,
            digest,
            created: config.created,
            labels: config.config.labels.unwrap_or_default(),
            architecture: config.architecture,
            os: config.os,
        }))
    }

    /// GET with basic auth; `None` on 404.
    async fn get(
        &self,
        url: &str,
        accept: Option<&str>,
        image_ref: &str,
    ) -> Result<Option<reqwest::Response>> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(|e| CapsuleError::RegistryError {
            image: image_ref.to_string(),
            reason: format!("GET {} failed: {}", url, e),
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(CapsuleError::RegistryError {
                image: image_ref.to_string(),
                reason: format!("GET {} returned {}", url, status),
            }),
        }
    }
}
