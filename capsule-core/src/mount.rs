//! Working mounts for recorded runs.
//!
//! Each run gets a private directory under the runs directory, seeded from the
//! user workspace and bound into the run container. The directory outlives the
//! run so its artifacts (`.stdout`, `.stderr`, `.entrypoint`, `.resources`) can
//! be collected afterwards.

use crate::builder::context::copy_tree;
use crate::error::{CapsuleError, Result};
use crate::types::RunMount;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Prepares and releases per-run working mounts.
#[async_trait]
pub trait MountManager: Send + Sync {
    /// Prepare the mount for a run, seeding it from `workspace` when given.
    ///
    /// Fails with `MountInUse` while another holder has the same mount.
    async fn acquire(&self, run_id: &str, workspace: Option<&Path>) -> Result<RunMount>;

    /// Release a mount. Releasing an unknown mount is a no-op.
    async fn release(&self, mount: &RunMount) -> Result<()>;
}

/// Mount identifier for a run: the first 16 hex digits of sha256(run id).
pub fn mount_id(run_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Mounts backed by directories on local storage.
#[derive(Debug)]
pub struct LocalMountManager {
    runs_dir: PathBuf,
    active: Mutex<HashSet<String>>,
}

impl LocalMountManager {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self { runs_dir: runs_dir.into(), active: Mutex::new(HashSet::new()) }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Number of mounts currently held.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

#[async_trait]
impl MountManager for LocalMountManager {
    #[instrument(skip(self, workspace))]
    async fn acquire(&self, run_id: &str, workspace: Option<&Path>) -> Result<RunMount> {
        let id = mount_id(run_id);

        if !self.active.lock().await.insert(id.clone()) {
            return Err(CapsuleError::MountInUse { mount_id: id });
        }

        let host_path = self.runs_dir.join(&id);
        let seed = workspace.map(Path::to_path_buf);
        let target = host_path.clone();
        let prepared = tokio::task::spawn_blocking(move || -> Result<usize> {
            std::fs::create_dir_all(&target).map_err(|e| CapsuleError::io(&target, e))?;
            let mut copied = Vec::new();
            if let Some(seed) = seed {
                copy_tree(&seed, &target, &mut copied)?;
            }
            Ok(copied.len())
        })
        .await
        .map_err(CapsuleError::internal)
        .and_then(|r| r);

        match prepared {
            Ok(files) => {
                info!(mount_id = %id, path = %host_path.display(), files, "Run mount prepared");
                Ok(RunMount { id, host_path, helper_id: None })
            }
            Err(e) => {
                self.active.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    async fn release(&self, mount: &RunMount) -> Result<()> {
        if self.active.lock().await.remove(&mount.id) {
            debug!(mount_id = %mount.id, "Run mount released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mount_id_is_stable() {
        assert_eq!(mount_id("run-1"), mount_id("run-1"));
        assert_ne!(mount_id("run-1"), mount_id("run-2"));
        assert_eq!(mount_id("run-1").len(), 16);
    }

    #[tokio::test]
    async fn test_acquire_seeds_workspace() {
        let workspace = TempDir::new().unwrap();
        std::fs::create_dir_all(workspace.path().join("src")).unwrap();
        std::fs::write(workspace.path().join("src/main.py"), "print(1)").unwrap();
        let runs = TempDir::new().unwrap();

        let manager = LocalMountManager::new(runs.path());
        let mount = manager.acquire("run-1", Some(workspace.path())).await.unwrap();

        assert_eq!(mount.host_path, runs.path().join(mount_id("run-1")));
        assert!(mount.host_path.join("src/main.py").is_file());
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_mount_is_exclusive_until_released() {
        let runs = TempDir::new().unwrap();
        let manager = LocalMountManager::new(runs.path());

        let mount = manager.acquire("run-1", None).await.unwrap();
        let err = manager.acquire("run-1", None).await.unwrap_err();
        assert!(matches!(err, CapsuleError::MountInUse { .. }));

        manager.release(&mount).await.unwrap();
        manager.release(&mount).await.unwrap();
        assert_eq!(manager.active_count().await, 0);
        assert!(mount.host_path.exists());

        manager.acquire("run-1", None).await.unwrap();
    }
}
