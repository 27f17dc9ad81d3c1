//! Centralized path configuration for Capsule.
//!
//! All data paths should go through this module so build contexts, run mounts and
//! configuration land in consistent places whether running as a user or a service.

use std::path::PathBuf;

/// Get the Capsule data directory.
///
/// Resolution order:
/// 1. `CAPSULE_DATA_DIR` environment variable
/// 2. `/var/lib/capsule` if it exists (system install)
/// 3. `~/.capsule` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CAPSULE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/capsule");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".capsule")).unwrap_or(system_dir)
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CAPSULE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().map(|c| c.join("capsule")).unwrap_or_else(|| data_dir().join("config"))
}
