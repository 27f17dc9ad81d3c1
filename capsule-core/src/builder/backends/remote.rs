//! Remote build service backend.
//!
//! The service exposes `PUT /pull`, `PUT /push` and `POST /build`, each answering
//! with a newline-delimited JSON stream of progress messages ending in an error or
//! a result line.

use super::{BuildRequest, BuildRun, BuilderBackend};
use crate::builder::hash::OutputDigest;
use crate::error::{CapsuleError, Result};
use crate::registry::RegistryProbe;
use crate::types::CachedImageRecord;
use crate::upstream::ProgressSink;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// One line of a service response stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Result {
        exit_status: i64,
        #[serde(default)]
        output_digest: Option<String>,
    },
    Error {
        error: String,
    },
    Progress {
        message: String,
    },
}

/// Decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Progress(String),
    Error(String),
    Result { exit_status: i64, output_digest: Option<String> },
    /// Line that was not a recognized message
    Raw(String),
}

impl StreamEvent {
    /// Parse one NDJSON line.
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<WireMessage>(line) {
            Ok(WireMessage::Result { exit_status, output_digest }) => {
                Self::Result { exit_status, output_digest }
            }
            Ok(WireMessage::Error { error }) => Self::Error(error),
            Ok(WireMessage::Progress { message }) => Self::Progress(message),
            Err(_) => Self::Raw(line.to_string()),
        }
    }
}

/// Builds images through a remote build service.
pub struct RemoteServiceBackend {
    client: reqwest::Client,
    base_url: String,
    registry: Arc<RegistryProbe>,
    progress: Arc<dyn ProgressSink>,
}

impl RemoteServiceBackend {
    pub fn new(
        base_url: impl Into<String>,
        registry: Arc<RegistryProbe>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(CapsuleError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            registry,
            progress,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Consume a response stream until its terminal line.
    ///
    /// Returns `None` when cancelled. Progress and raw lines go into `digest` and,
    /// unless `quiet`, to the progress sink.
    async fn consume(
        &self,
        response: reqwest::Response,
        digest: &mut OutputDigest,
        quiet: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<(i64, Option<String>)>> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapsuleError::RemoteBuilderError {
                reason: format!("service returned {}: {}", status, body.trim()),
            });
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut buffer: Vec<u8> = Vec::new();
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                chunk = body.next() => chunk,
            };

            let finished = match chunk {
                Some(chunk) => {
                    buffer.extend_from_slice(&chunk?);
                    false
                }
                None => true,
            };

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(result) = self.handle_line(&raw[..raw.len() - 1], digest, quiet)? {
                    return Ok(Some(result));
                }
            }

            if finished {
                if !buffer.is_empty() {
                    let rest = std::mem::take(&mut buffer);
                    if let Some(result) = self.handle_line(&rest, digest, quiet)? {
                        return Ok(Some(result));
                    }
                }
                return Err(CapsuleError::RemoteBuilderError {
                    reason: "stream ended without a result".to_string(),
                });
            }
        }
    }

    fn handle_line(
        &self,
        raw: &[u8],
        digest: &mut OutputDigest,
        quiet: bool,
    ) -> Result<Option<(i64, Option<String>)>> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(None);
        }

        match StreamEvent::parse(line) {
            StreamEvent::Result { exit_status, output_digest } => {
                Ok(Some((exit_status, output_digest)))
            }
            StreamEvent::Error(reason) => Err(CapsuleError::RemoteBuilderError { reason }),
            StreamEvent::Progress(text) | StreamEvent::Raw(text) => {
                for text_line in text.lines() {
                    digest.feed_line(text_line);
                    if !quiet {
                        self.progress.report(text_line);
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Pack a context directory into a gzip-compressed tar archive.
pub fn pack_context(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);
    archive.append_dir_all(".", dir).map_err(|e| CapsuleError::io(dir, e))?;
    let encoder = archive.into_inner().map_err(|e| CapsuleError::io(dir, e))?;
    encoder.finish().map_err(|e| CapsuleError::io(dir, e))
}

#[async_trait]
impl BuilderBackend for RemoteServiceBackend {
    #[instrument(skip(self, request, cancel), fields(image = %request.image))]
    async fn run(
        &self,
        request: &BuildRequest<'_>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BuildRun> {
        let dir: PathBuf = request.context.path().to_path_buf();
        let body = tokio::task::spawn_blocking(move || pack_context(&dir))
            .await
            .map_err(CapsuleError::internal)??;
        debug!(bytes = body.len(), "Uploading build context");

        let send = self
            .client
            .post(self.url("/build"))
            .query(&[("image", request.image), ("dry_run", if dry_run { "true" } else { "false" })])
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(BuildRun::cancelled()),
            response = send => response?,
        };

        let mut digest = OutputDigest::new();
        match self.consume(response, &mut digest, dry_run, Some(cancel)).await? {
            None => {
                info!("Build cancelled, closing service stream");
                Ok(BuildRun::cancelled())
            }
            Some((exit_status, reported)) => {
                let output_digest = reported.unwrap_or_else(|| digest.finish());
                Ok(BuildRun { exit_status, output_digest })
            }
        }
    }

    #[instrument(skip(self))]
    async fn push(&self, image: &str) -> Result<()> {
        let response = self.client.put(self.url("/push")).query(&[("image", image)]).send().await?;
        let mut digest = OutputDigest::new();
        match self.consume(response, &mut digest, false, None).await? {
            Some((0, _)) => Ok(()),
            Some((status, _)) => Err(CapsuleError::RegistryError {
                image: image.to_string(),
                reason: format!("push exited with status {}", status),
            }),
            None => Err(CapsuleError::Cancelled),
        }
    }

    #[instrument(skip(self))]
    async fn pull_builder_tool(&self) -> Result<()> {
        let response = self.client.put(self.url("/pull")).send().await?;
        let mut digest = OutputDigest::new();
        match self.consume(response, &mut digest, false, None).await? {
            Some((0, _)) => Ok(()),
            Some((status, _)) => Err(CapsuleError::RemoteBuilderError {
                reason: format!("pull exited with status {}", status),
            }),
            None => Err(CapsuleError::Cancelled),
        }
    }

    async fn probe_cache(&self, image: &str) -> Result<Option<CachedImageRecord>> {
        self.registry.probe(image).await
    }

    fn name(&self) -> &str {
        "remote"
    }
}
