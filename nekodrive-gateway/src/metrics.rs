//! Prometheus Metrics for the NekoDrive Gateway
//!
//! Exposes metrics at GET /metrics in Prometheus text format.
//! Uses the `metrics` crate with the prometheus exporter. Engine components
//! record their own counters (`chunks_committed_total`,
//! `shard_operations_total`, ...); the helpers below cover gauges derived
//! from manifest state.

use axum::{routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use nekodrive_metadata::ManifestStats;
use nekodrive_storage::CircuitState;
use std::sync::Arc;

/// Install the Prometheus recorder globally and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Create metrics route that can be merged into any Router
pub fn routes<S: Clone + Send + Sync + 'static>(handle: PrometheusHandle) -> Router<S> {
    let handle = Arc::new(handle);
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    )
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Publish manifest totals as gauges
pub fn record_manifest_stats(stats: &ManifestStats) {
    gauge!("files_active").set(stats.active_files as f64);
    gauge!("files_active_bytes").set(stats.active_bytes as f64);
    gauge!("files_trashed").set(stats.trashed_files as f64);
    gauge!("files_trashed_bytes").set(stats.trashed_bytes as f64);
    gauge!("uploads_pending").set(stats.pending_uploads as f64);
    gauge!("snapshots_retained").set(stats.snapshots as f64);
    gauge!("shard_gc_backlog").set(stats.gc_backlog as f64);
    gauge!("manifest_db_bytes").set(stats.db_size as f64);
}

/// Record circuit breaker state (0 closed, 1 half-open, 2 open)
pub fn record_circuit_state(state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("shard_circuit_state").set(value);
}
