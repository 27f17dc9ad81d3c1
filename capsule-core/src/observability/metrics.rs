//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use crate::types::RunState;
use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // Build metrics
    describe_histogram!(
        "capsule_build_duration_seconds",
        "Image build duration, dry run through push (by backend)"
    );
    describe_counter!("capsule_build_failures_total", "Total number of build failures (by reason)");
    describe_counter!(
        "capsule_cache_hits_total",
        "Builds skipped because the registry already held the tag"
    );

    // Run metrics
    describe_counter!("capsule_runs_total", "Recorded runs finished (by terminal state)");
    describe_histogram!("capsule_run_duration_seconds", "Recorded run duration (by state)");

    // Cleanup metrics
    describe_counter!(
        "capsule_cleanup_failures_total",
        "Resources that could not be released (by resource)"
    );
}

pub fn record_build(duration_secs: f64, backend: &str) {
    histogram!("capsule_build_duration_seconds", "backend" => backend.to_string())
        .record(duration_secs);
}

pub fn record_build_failure(reason: &str) {
    counter!("capsule_build_failures_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_cache_hit() {
    counter!("capsule_cache_hits_total").increment(1);
}

pub fn record_run(state: RunState, duration_secs: f64) {
    counter!("capsule_runs_total", "state" => state.to_string()).increment(1);
    histogram!("capsule_run_duration_seconds", "state" => state.to_string())
        .record(duration_secs);
}

pub fn record_cleanup_failure(resource: &str) {
    counter!("capsule_cleanup_failures_total", "resource" => resource.to_string()).increment(1);
}
