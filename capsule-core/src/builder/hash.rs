//! Content hashing for image tags.
//!
//! The environment hash covers every (relative path, bytes) pair of a build context
//! in path order; the output hash covers the build tool's dry-run transcript.

use crate::error::{CapsuleError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Build tool output lines starting with this prefix embed a temp path and are
/// left out of the output digest.
pub const NON_DETERMINISTIC_PREFIX: &str = "Using local repo";

/// Hash a build context directory.
///
/// Files are fed in relative-path order so the result does not depend on the
/// order the filesystem lists them in. The force token, if any, is mixed in last.
pub fn hash_context(dir: &Path, force_token: Option<&str>) -> Result<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| CapsuleError::ContextError {
            reason: format!("Failed to walk {}: {}", dir.display(), e),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).map_err(CapsuleError::internal)?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((key, entry.into_path()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (key, path) in &files {
        let bytes = std::fs::read(path).map_err(|e| CapsuleError::io(path, e))?;
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }

    if let Some(token) = force_token {
        hasher.update(token.as_bytes());
    }

    let hash = format!("{:x}", hasher.finalize());
    debug!(
        files = files.len(),
        forced = force_token.is_some(),
        hash = %hash,
        "Hashed build context"
    );
    Ok(hash)
}

/// Rolling digest over build tool output.
#[derive(Debug, Clone, Default)]
pub struct OutputDigest {
    hasher: Sha256,
    lines: usize,
}

impl OutputDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line. Returns false when the line was filtered out.
    pub fn feed_line(&mut self, line: &str) -> bool {
        if line.starts_with(NON_DETERMINISTIC_PREFIX) {
            return false;
        }
        self.hasher.update(line.as_bytes());
        self.hasher.update(b"\n");
        self.lines += 1;
        true
    }

    /// Number of lines that went into the digest.
    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}
