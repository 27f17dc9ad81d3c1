//! Core domain types for Capsule.

pub mod image;
pub mod run;

// Re-exports
pub use image::{CachedImageRecord, EnvironmentDescriptor, ImageRef, ImageTag};
pub use run::{
    RunMount, RunOutcome, RunRecord, RunResources, RunState, RunStatus, CANCELLED_EXIT_STATUS,
};
