//! Cluster orchestrator abstraction.
//!
//! The cluster job backend needs only a handful of orchestrator objects:
//! config maps carrying the build context, single-attempt batch jobs, their pods
//! and pod logs. `ClusterApi` covers exactly that surface.

use crate::engine::LogStream;
use crate::error::Result;
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use std::collections::BTreeMap;

mod kubectl;
pub use kubectl::KubectlCluster;

/// Label attached to every object created on behalf of a build.
pub const JOB_LABEL: &str = "capsule.io/job";

/// A config map holding binary files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMapSpec {
    pub name: String,
    /// Key -> file bytes
    pub binary_data: BTreeMap<String, Vec<u8>>,
    pub labels: BTreeMap<String, String>,
}

/// How a config map is projected into a job's filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMapVolume {
    pub config_map: String,
    pub mount_path: String,
    /// (key, relative path) pairs
    pub items: Vec<(String, String)>,
}

/// Host path mounted into the job container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPathVolume {
    pub host_path: String,
    pub mount_path: String,
}

/// A single-attempt batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub config_map: Option<ConfigMapVolume>,
    pub host_paths: Vec<HostPathVolume>,
    pub privileged: bool,
    pub labels: BTreeMap<String, String>,
}

/// Pod counts reported in a job's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl JobStatus {
    /// Parse the `status` block of a job object.
    pub fn from_job(job: &Value) -> Self {
        let count = |field: &str| {
            job.pointer(&format!("/status/{}", field))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32
        };
        Self { active: count("active"), succeeded: count("succeeded"), failed: count("failed") }
    }
}

/// Cluster orchestrator trait.
///
/// Delete operations succeed when the object is already gone.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_config_map(&self, spec: &ConfigMapSpec) -> Result<()>;

    async fn create_job(&self, spec: &JobSpec) -> Result<()>;

    async fn job_status(&self, name: &str) -> Result<JobStatus>;

    /// Name of the pod running a job, once one has been scheduled.
    async fn job_pod(&self, job: &str) -> Result<Option<String>>;

    /// Follow a pod's log from the start.
    ///
    /// A follow that fails (for instance because the container has not started)
    /// ends with an `Err` item.
    async fn pod_logs(&self, pod: &str) -> Result<LogStream>;

    /// Whether the pod has reached a terminal phase.
    async fn pod_finished(&self, pod: &str) -> Result<bool>;

    async fn delete_job(&self, name: &str) -> Result<()>;

    async fn delete_pod(&self, name: &str) -> Result<()>;

    async fn delete_config_map(&self, name: &str) -> Result<()>;

    /// Orchestrator name (for logging).
    fn name(&self) -> &str;
}

fn labels_value(labels: &BTreeMap<String, String>) -> Value {
    Value::Object(labels.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect())
}

/// Render a config map manifest.
pub fn config_map_manifest(spec: &ConfigMapSpec, namespace: &str) -> Value {
    let engine = base64::engine::general_purpose::STANDARD;
    let binary_data: serde_json::Map<String, Value> = spec
        .binary_data
        .iter()
        .map(|(key, bytes)| (key.clone(), Value::String(engine.encode(bytes))))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": spec.name,
            "namespace": namespace,
            "labels": labels_value(&spec.labels),
        },
        "binaryData": binary_data,
    })
}

/// Render a job manifest: one attempt, never restarted.
pub fn job_manifest(spec: &JobSpec, namespace: &str) -> Value {
    let env: Vec<Value> =
        spec.env.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    if let Some(cm) = &spec.config_map {
        let items: Vec<Value> =
            cm.items.iter().map(|(key, path)| json!({ "key": key, "path": path })).collect();
        volumes.push(json!({
            "name": "context",
            "configMap": { "name": cm.config_map, "items": items },
        }));
        mounts.push(json!({ "name": "context", "mountPath": cm.mount_path, "readOnly": true }));
    }

    for (index, host) in spec.host_paths.iter().enumerate() {
        let name = format!("host-{}", index);
        volumes.push(json!({ "name": name, "hostPath": { "path": host.host_path } }));
        mounts.push(json!({ "name": name, "mountPath": host.mount_path }));
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": spec.name,
            "namespace": namespace,
            "labels": labels_value(&spec.labels),
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": labels_value(&spec.labels) },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "build",
                        "image": spec.image,
                        "command": spec.command,
                        "env": env,
                        "volumeMounts": mounts,
                        "securityContext": { "privileged": spec.privileged },
                    }],
                    "volumes": volumes,
                },
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_manifest_is_single_attempt() {
        let spec = JobSpec {
            name: "build-abc".into(),
            image: "capsule/repo2docker:latest".into(),
            command: vec!["jupyter-repo2docker".into(), "--no-run".into()],
            config_map: Some(ConfigMapVolume {
                config_map: "build-abc".into(),
                mount_path: "/context".into(),
                items: vec![("f0".into(), "apt.txt".into())],
            }),
            privileged: true,
            ..Default::default()
        };
        let manifest = job_manifest(&spec, "builds");

        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        assert_eq!(manifest["metadata"]["namespace"], "builds");
        let pod = &manifest["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(pod["volumes"][0]["configMap"]["items"][0]["path"], "apt.txt");
        assert_eq!(pod["containers"][0]["volumeMounts"][0]["mountPath"], "/context");
    }

    #[test]
    fn test_config_map_binary_data_is_base64() {
        let mut spec = ConfigMapSpec { name: "ctx".into(), ..Default::default() };
        spec.binary_data.insert("f0".into(), b"vim".to_vec());
        let manifest = config_map_manifest(&spec, "default");
        assert_eq!(manifest["binaryData"]["f0"], "dmlt");
    }

    #[test]
    fn test_job_status_from_json() {
        let job = json!({ "status": { "active": 1, "failed": 2 } });
        assert_eq!(JobStatus::from_job(&job), JobStatus { active: 1, succeeded: 0, failed: 2 });
        assert_eq!(JobStatus::from_job(&json!({})), JobStatus::default());
    }
}
