//! Observability infrastructure: tracing and metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Metrics listener address from `CAPSULE_METRICS_ADDR` (e.g. `0.0.0.0:9464`).
fn metrics_addr() -> Option<String> {
    std::env::var("CAPSULE_METRICS_ADDR").ok().filter(|addr| !addr.is_empty())
}

/// Initialize the global observability infrastructure.
///
/// Call once at startup. A second call fails because the global subscriber is
/// already set.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    if let Some(addr) = metrics_addr() {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!("Prometheus exporter listening on {}", addr);
    } else {
        tracing::info!("Observability initialized (set CAPSULE_METRICS_ADDR to export metrics)");
    }

    metrics::register_core_metrics();

    Ok(())
}
