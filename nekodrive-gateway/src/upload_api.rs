//! Resumable upload endpoints
//!
//! ```text
//! POST   /upload/session                        open a session
//! GET    /upload/session/:token                 resume view
//! DELETE /upload/session/:token                 abort
//! PUT    /upload/session/:token/chunk/:index    upload one chunk (x-chunk-digest)
//! POST   /upload/session/:token/complete        promote into a file
//! DELETE /upload/file/pending/all[?force=true]  orphan sweep
//! ```

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, post, put},
    Json, Router,
};
use bytes::Bytes;
use nekodrive_core::{ContentHash, NekoError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::ApiResult;
use crate::sessions::StartUpload;
use crate::AppState;

/// Hex Blake3 digest of the chunk body
pub const CHUNK_DIGEST_HEADER: &str = "x-chunk-digest";

/// Upload routes; `max_chunk` bounds request bodies
pub fn routes(max_chunk: usize) -> Router<Arc<AppState>> {
    Router::new()
        .route("/upload/session", post(start_session))
        .route(
            "/upload/session/:token",
            delete(abort_session).get(resume_session),
        )
        .route("/upload/session/:token/chunk/:index", put(put_chunk))
        .route("/upload/session/:token/complete", post(complete_session))
        .route("/upload/file/pending/all", delete(purge_pending))
        .layer(DefaultBodyLimit::max(max_chunk + 64 * 1024))
}

/// POST /upload/session
#[instrument(skip(state, req), fields(name = %req.name, size = req.size))]
async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartUpload>,
) -> ApiResult<impl IntoResponse> {
    let ticket = state.sessions().start(req).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

/// GET /upload/session/:token
#[instrument(skip_all)]
async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sessions().resume(&token)?))
}

/// DELETE /upload/session/:token
#[instrument(skip_all)]
async fn abort_session(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.sessions().abort(&token)?;
    Ok(Json(json!({ "aborted": true })))
}

/// PUT /upload/session/:token/chunk/:index
#[instrument(skip(state, token, headers, body), fields(len = body.len()))]
async fn put_chunk(
    State(state): State<Arc<AppState>>,
    Path((token, index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let digest = headers
        .get(CHUNK_DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            NekoError::InvalidRequest(format!("missing {} header", CHUNK_DIGEST_HEADER))
        })?;
    let expected = ContentHash::from_hex(digest.trim())
        .map_err(|e| NekoError::InvalidRequest(format!("bad {}: {}", CHUNK_DIGEST_HEADER, e)))?;

    debug!(index, "Receiving chunk");
    let receipt = state
        .sessions()
        .put_chunk(&token, index, body, expected)
        .await?;
    Ok(Json(receipt))
}

/// POST /upload/session/:token/complete
#[instrument(skip_all)]
async fn complete_session(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sessions().complete(&token).await?))
}

#[derive(Debug, Deserialize)]
struct PurgePendingQuery {
    #[serde(default)]
    force: bool,
}

/// DELETE /upload/file/pending/all
#[instrument(skip(state))]
async fn purge_pending(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PurgePendingQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sweep_orphans(query.force).await?))
}
