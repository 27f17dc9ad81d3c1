//! Run catalog: where run state and resources are persisted.
//!
//! The catalog is an external key-value store keyed by run id. Writes are
//! at-least-once and carry no transactional guarantees; the reconcile sweep
//! repairs whatever a crash leaves behind.

use crate::error::{CapsuleError, Result};
use crate::types::{RunRecord, RunResources, RunState};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Run catalog trait.
#[async_trait]
pub trait RunCatalog: Send + Sync {
    /// Persist a run's state, creating the record if needed.
    async fn set_run_state(&self, run_id: &str, state: RunState) -> Result<()>;

    /// Persist the resources currently held by a run.
    async fn record_resources(&self, run_id: &str, resources: &RunResources) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Runs in STARTING or RUNNING.
    async fn list_active_runs(&self) -> Result<Vec<RunRecord>>;
}

/// In-process catalog for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    runs: RwLock<HashMap<String, RunRecord>>,
    history: RwLock<Vec<(String, RunState)>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: RunRecord) {
        self.runs.write().await.insert(record.id.clone(), record);
    }

    /// Every state written for a run, oldest first.
    pub async fn history(&self, run_id: &str) -> Vec<RunState> {
        self.history
            .read()
            .await
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl RunCatalog for InMemoryCatalog {
    async fn set_run_state(&self, run_id: &str, state: RunState) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.entry(run_id.to_string())
            .and_modify(|record| record.state = state)
            .or_insert_with(|| RunRecord {
                id: run_id.to_string(),
                state,
                resources: RunResources::default(),
                job_id: None,
            });
        self.history.write().await.push((run_id.to_string(), state));
        Ok(())
    }

    async fn record_resources(&self, run_id: &str, resources: &RunResources) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(run_id).ok_or_else(|| CapsuleError::CatalogError {
            reason: format!("unknown run {}", run_id),
        })?;
        record.resources = resources.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_active_runs(&self) -> Result<Vec<RunRecord>> {
        let runs = self.runs.read().await;
        let mut active: Vec<RunRecord> =
            runs.values().filter(|r| !r.state.is_terminal()).cloned().collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}

/// Run document as exchanged with the catalog service.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunDocument {
    #[serde(rename = "_id")]
    id: String,
    status: i32,
    #[serde(default)]
    resources: RunResources,
    #[serde(default, rename = "jobId")]
    job_id: Option<String>,
}

impl RunDocument {
    fn into_record(self) -> Result<RunRecord> {
        let state = RunState::from_code(self.status).ok_or_else(|| CapsuleError::CatalogError {
            reason: format!("run {} has unknown status code {}", self.id, self.status),
        })?;
        Ok(RunRecord { id: self.id, state, resources: self.resources, job_id: self.job_id })
    }
}

/// Catalog service client.
///
/// - `GET /run/{id}`
/// - `PUT /run/{id}/status`
/// - `PATCH /run/{id}`
/// - `GET /run?active=true`
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(CapsuleError::Http)?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), token })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CapsuleError::CatalogError {
            reason: format!("{} returned {}: {}", what, status, body.trim()),
        })
    }
}

#[async_trait]
impl RunCatalog for HttpCatalog {
    #[instrument(skip(self))]
    async fn set_run_state(&self, run_id: &str, state: RunState) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/run/{}/status", run_id))
            .json(&serde_json::json!({ "status": state.code() }))
            .send()
            .await?;
        Self::check(response, "PUT run status").await?;
        debug!(run_id = %run_id, state = %state, "Run state persisted");
        Ok(())
    }

    async fn record_resources(&self, run_id: &str, resources: &RunResources) -> Result<()> {
        let response = self
            .request(reqwest::Method::PATCH, &format!("/run/{}", run_id))
            .json(&serde_json::json!({ "resources": resources }))
            .send()
            .await?;
        Self::check(response, "PATCH run").await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let response =
            self.request(reqwest::Method::GET, &format!("/run/{}", run_id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let document: RunDocument = Self::check(response, "GET run").await?.json().await?;
        document.into_record().map(Some)
    }

    async fn list_active_runs(&self) -> Result<Vec<RunRecord>> {
        let response = self.request(reqwest::Method::GET, "/run?active=true").send().await?;
        let documents: Vec<RunDocument> = Self::check(response, "GET runs").await?.json().await?;
        documents.into_iter().map(RunDocument::into_record).collect()
    }
}
