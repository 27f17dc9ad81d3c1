//! `kubectl`-backed cluster access.
//!
//! Objects are submitted as JSON manifests on stdin and read back with `-o json`.

use super::{config_map_manifest, job_manifest, ClusterApi, ConfigMapSpec, JobSpec, JobStatus};
use crate::engine::{LogLine, LogStream};
use crate::error::{CapsuleError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

/// Cluster access through the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    binary: String,
    namespace: String,
}

impl KubectlCluster {
    pub fn new(binary: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { binary: binary.into(), namespace: namespace.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--namespace").arg(&self.namespace);
        cmd
    }

    /// Run kubectl to completion and return stdout.
    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| CapsuleError::ClusterError {
            reason: format!("Failed to spawn {}: {}", self.binary, e),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.map_err(|e| CapsuleError::ClusterError {
                reason: format!("Failed to write manifest: {}", e),
            })?;
            // Close stdin so kubectl sees EOF.
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(|e| CapsuleError::ClusterError {
            reason: format!("kubectl {} failed: {}", args.join(" "), e),
        })?;

        if !output.status.success() {
            return Err(CapsuleError::ClusterError {
                reason: format!(
                    "kubectl {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    async fn create(&self, manifest: &Value) -> Result<()> {
        let body = serde_json::to_vec(manifest)?;
        self.run(&["create", "-f", "-"], Some(&body)).await?;
        Ok(())
    }

    async fn get_json(&self, args: &[&str]) -> Result<Value> {
        let mut full: Vec<&str> = vec!["get"];
        full.extend_from_slice(args);
        full.extend_from_slice(&["-o", "json"]);
        let stdout = self.run(&full, None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<()> {
        self.run(&["delete", kind, name, "--ignore-not-found", "--wait=false"], None).await?;
        debug!(kind = %kind, name = %name, "Deleted cluster object");
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubectlCluster {
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_config_map(&self, spec: &ConfigMapSpec) -> Result<()> {
        self.create(&config_map_manifest(spec, &self.namespace)).await
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        self.create(&job_manifest(spec, &self.namespace)).await
    }

    async fn job_status(&self, name: &str) -> Result<JobStatus> {
        let job = self.get_json(&["job", name]).await?;
        Ok(JobStatus::from_job(&job))
    }

    async fn job_pod(&self, job: &str) -> Result<Option<String>> {
        let selector = format!("job-name={}", job);
        let pods = self.get_json(&["pods", "-l", &selector]).await?;
        Ok(pods
            .pointer("/items/0/metadata/name")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn pod_logs(&self, pod: &str) -> Result<LogStream> {
        let mut child = self
            .command()
            .args(["logs", "-f", pod])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CapsuleError::ClusterError {
                reason: format!("Failed to spawn {}: {}", self.binary, e),
            })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                return Err(CapsuleError::ClusterError {
                    reason: "kubectl logs produced no output pipes".to_string(),
                })
            }
        };

        let (tx, rx) = mpsc::channel::<Result<LogLine>>(256);
        let pod = pod.to_string();
        tokio::spawn(async move {
            // Collected alongside stdout so a chatty stderr cannot block kubectl.
            let errors = tokio::spawn(async move {
                let mut text = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut text).await;
                text
            });

            let mut lines = BufReader::new(stdout).lines();
            let mut consumer_gone = false;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Ok(LogLine::stdout(line))).await.is_err() {
                            consumer_gone = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(pod = %pod, "Log stream error: {}", e);
                        break;
                    }
                }
            }

            if consumer_gone {
                let _ = child.start_kill();
                let _ = child.wait().await;
                errors.abort();
                return;
            }

            let status = child.wait().await;
            let stderr = errors.await.unwrap_or_default();
            let failure = match status {
                Ok(status) if status.success() => None,
                Ok(status) => Some(format!(
                    "kubectl logs {} exited with {}: {}",
                    pod,
                    status,
                    stderr.trim()
                )),
                Err(e) => Some(format!("kubectl logs {} failed: {}", pod, e)),
            };
            if let Some(reason) = failure {
                debug!(pod = %pod, reason = %reason, "Log follow failed");
                let _ = tx.send(Err(CapsuleError::ClusterError { reason })).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn pod_finished(&self, pod: &str) -> Result<bool> {
        let pod = self.get_json(&["pod", pod]).await?;
        Ok(matches!(
            pod.pointer("/status/phase").and_then(Value::as_str),
            Some("Succeeded") | Some("Failed")
        ))
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.delete("job", name).await
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.delete("pod", name).await
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.delete("configmap", name).await
    }

    fn name(&self) -> &str {
        "kubectl"
    }
}
