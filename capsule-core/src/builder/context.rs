//! Build context assembly.
//!
//! A build context is the set of files handed to the build tool: the well-known
//! recipe files, explicitly requested extras (or the whole workspace), and a
//! synthesized environment descriptor.

use crate::builder::hash::hash_context;
use crate::error::{CapsuleError, Result};
use crate::types::EnvironmentDescriptor;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Extras token meaning "copy the entire workspace".
pub const WILDCARD: &str = "*";

/// Name of the synthesized descriptor file.
pub const DESCRIPTOR_FILE: &str = "environment.json";

/// Recipe files the build tool understands, fetched when present.
pub const RECIPE_FILES: &[&str] = &[
    "apt.txt",
    "environment.yml",
    "install.R",
    "postBuild",
    "requirements.txt",
    "REQUIRE",
    "runtime.txt",
    "setup.py",
    "Project.toml",
    "Manifest.toml",
    "start",
    "default.nix",
    "Dockerfile",
    "DESCRIPTION",
    "Pipfile",
    "Pipfile.lock",
];

/// Read access to a user workspace.
pub trait WorkspaceSource: Send + Sync {
    /// Workspace root on local storage.
    fn root(&self) -> &Path;

    /// Resolve a workspace-relative path.
    ///
    /// Returns `None` for missing paths, absolute paths and paths escaping the root.
    fn resolve(&self, relative: &str) -> Option<PathBuf>;
}

/// Workspace stored in a local directory.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl WorkspaceSource for LocalWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let path = Path::new(relative);
        let confined = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || !confined {
            return None;
        }
        let full = self.root.join(path);
        full.exists().then_some(full)
    }
}

/// An assembled build context on ephemeral storage.
///
/// The directory is removed when the context is dropped.
#[derive(Debug)]
pub struct BuildContext {
    dir: TempDir,
    files: Vec<String>,
    descriptor: EnvironmentDescriptor,
}

impl BuildContext {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Relative paths copied from the workspace (excluding the descriptor).
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.descriptor
    }

    /// Environment hash of this context.
    pub fn environment_hash(&self, force_token: Option<&str>) -> Result<String> {
        hash_context(self.path(), force_token)
    }
}

/// Materializes build contexts from workspaces.
#[derive(Debug, Clone, Default)]
pub struct BuildContextAssembler {
    scratch_dir: Option<PathBuf>,
}

impl BuildContextAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create contexts below `dir` instead of the system temp directory.
    pub fn with_scratch_dir(dir: impl Into<PathBuf>) -> Self {
        Self { scratch_dir: Some(dir.into()) }
    }

    /// Assemble a build context. Blocking; run it off the async executor.
    #[instrument(skip_all, fields(workspace = %workspace.root().display(), extras = extras.len()))]
    pub fn assemble(
        &self,
        workspace: &dyn WorkspaceSource,
        extras: &[String],
        descriptor: &EnvironmentDescriptor,
    ) -> Result<BuildContext> {
        let dir = self.create_dir()?;
        let mut files = Vec::new();

        if extras.iter().any(|e| e == WILDCARD) {
            copy_tree(workspace.root(), dir.path(), &mut files)?;
        } else {
            for name in RECIPE_FILES {
                if let Some(source) = workspace.resolve(name) {
                    if source.is_file() {
                        copy_file(&source, &dir.path().join(name))?;
                        files.push(name.to_string());
                    }
                }
            }

            for extra in extras {
                match workspace.resolve(extra) {
                    Some(source) if source.is_dir() => {
                        let target = dir.path().join(extra);
                        let mut copied = Vec::new();
                        copy_tree(&source, &target, &mut copied)?;
                        let prefix = extra.trim_end_matches('/');
                        files.extend(copied.into_iter().map(|f| format!("{}/{}", prefix, f)));
                    }
                    Some(source) => {
                        copy_file(&source, &dir.path().join(extra))?;
                        files.push(extra.clone());
                    }
                    None => info!(path = %extra, "Skipping unresolved extra path"),
                }
            }
        }

        let copied = files.len();
        files.retain(|f| f != DESCRIPTOR_FILE);
        if files.len() != copied {
            warn!(file = DESCRIPTOR_FILE, "Workspace file replaced by the synthesized descriptor");
        }
        write_descriptor(dir.path(), descriptor)?;
        files.sort();
        files.dedup();

        debug!(path = %dir.path().display(), files = files.len(), "Build context assembled");
        Ok(BuildContext { dir, files, descriptor: descriptor.clone() })
    }

    fn create_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("capsule-ctx-");
        match &self.scratch_dir {
            Some(scratch) => {
                fs::create_dir_all(scratch).map_err(|e| CapsuleError::io(scratch, e))?;
                builder.tempdir_in(scratch).map_err(|e| CapsuleError::io(scratch, e))
            }
            None => builder.tempdir().map_err(|e| CapsuleError::io(std::env::temp_dir(), e)),
        }
    }
}

/// Write the descriptor as pretty JSON.
///
/// Keys come out sorted: struct fields are declared in key order and the
/// environment is a `BTreeMap`.
fn write_descriptor(dir: &Path, descriptor: &EnvironmentDescriptor) -> Result<()> {
    let content = serde_json::to_string_pretty(descriptor)?;
    let path = dir.join(DESCRIPTOR_FILE);
    fs::write(&path, content).map_err(|e| CapsuleError::io(&path, e))
}

fn copy_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| CapsuleError::io(parent, e))?;
    }
    fs::copy(source, target).map_err(|e| CapsuleError::io(source, e))?;
    Ok(())
}

/// Recursively copy `source` into `target`, collecting copied relative paths.
pub(crate) fn copy_tree(source: &Path, target: &Path, copied: &mut Vec<String>) -> Result<()> {
    fs::create_dir_all(target).map_err(|e| CapsuleError::io(target, e))?;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| CapsuleError::ContextError {
            reason: format!("Failed to walk {}: {}", source.display(), e),
        })?;
        let relative = entry.path().strip_prefix(source).map_err(CapsuleError::internal)?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination).map_err(|e| CapsuleError::io(&destination, e))?;
        } else if entry.file_type().is_file() {
            copy_file(entry.path(), &destination)?;
            copied.push(
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            );
        }
    }
    Ok(())
}
