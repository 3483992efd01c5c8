//! System endpoints: snapshots, stats and health

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use nekodrive_metadata::SnapshotSummary;
use nekodrive_storage::{CircuitState, ShardStore, ShardStoreStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::metrics;
use crate::AppState;

/// Upper bound on the substrate ping during a health check
const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/system/backup", post(create_backup))
        .route("/system/snapshots", get(list_snapshots))
        .route("/system/restore/:snapshot_id", post(restore_snapshot))
        .route("/system/stats", get(stats))
        .route("/system/health", get(health))
}

/// POST /system/backup
#[instrument(skip(state))]
async fn create_backup(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let summary = state.lifecycle().snapshot().await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// GET /system/snapshots
#[instrument(skip(state))]
async fn list_snapshots(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let snapshots: Vec<SnapshotSummary> = state
        .manifest()
        .list_snapshots()?
        .iter()
        .map(SnapshotSummary::from)
        .collect();
    Ok(Json(snapshots))
}

/// POST /system/restore/:snapshot_id
#[instrument(skip(state))]
async fn restore_snapshot(
    State(state): State<Arc<AppState>>,
    Path(snapshot_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.restore_snapshot(snapshot_id).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Usage {
    total_size: u64,
    total_files: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    storage: Usage,
    trash: Usage,
    pending_uploads: u64,
    pending_bytes: u64,
    snapshots: u64,
    db_size: u64,
    shard_gc_backlog: u64,
    substrate: ShardStoreStats,
}

/// GET /system/stats
#[instrument(skip(state))]
async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let stats = state.manifest().stats()?;
    metrics::record_manifest_stats(&stats);

    Ok(Json(StatsResponse {
        storage: Usage {
            total_size: stats.active_bytes,
            total_files: stats.active_files,
        },
        trash: Usage {
            total_size: stats.trashed_bytes,
            total_files: stats.trashed_files,
        },
        pending_uploads: stats.pending_uploads,
        pending_bytes: stats.pending_bytes,
        snapshots: stats.snapshots,
        db_size: stats.db_size,
        shard_gc_backlog: stats.gc_backlog,
        substrate: state.shards().stats(),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum DatabaseHealth {
    Online,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum SubstrateHealth {
    Online,
    Degraded,
    Unreachable,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    database: DatabaseHealth,
    discord: SubstrateHealth,
    substrate: &'static str,
    circuit: CircuitState,
    version: &'static str,
    uptime: u64,
}

/// GET /system/health
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match state.manifest().size_on_disk() {
        Ok(_) => DatabaseHealth::Online,
        Err(e) => {
            warn!(error = %e, "Manifest health check failed");
            DatabaseHealth::Error
        }
    };

    let circuit = state.breaker().state();
    let discord = match circuit {
        CircuitState::Open => SubstrateHealth::Unreachable,
        CircuitState::HalfOpen => SubstrateHealth::Degraded,
        CircuitState::Closed => {
            match tokio::time::timeout(PING_TIMEOUT, state.shards().ping()).await {
                Ok(Ok(())) => SubstrateHealth::Online,
                Ok(Err(e)) => {
                    warn!(error = %e, "Substrate ping failed");
                    SubstrateHealth::Degraded
                }
                Err(_) => SubstrateHealth::Degraded,
            }
        }
    };

    let healthy = database == DatabaseHealth::Online && discord == SubstrateHealth::Online;
    let status = if database == DatabaseHealth::Online {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" },
            database,
            discord,
            substrate: state.shards().name(),
            circuit,
            version: env!("CARGO_PKG_VERSION"),
            uptime: state.uptime().as_secs(),
        }),
    )
}
