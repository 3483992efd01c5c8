//! File listing, download and trash endpoints

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use nekodrive_core::{ChunkRecord, NekoError};
use nekodrive_metadata::{EntryState, FileRecord, FileSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/files", get(list_files))
        .route("/files/:id", get(get_file).delete(trash_file))
        .route("/files/:id/content", get(download_file))
        .route("/files/:id/restore", post(restore_file))
        .route("/files/:id/purge", delete(purge_file))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileList {
    files: Vec<FileSummary>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct FileDetail {
    #[serde(flatten)]
    file: FileRecord,
    chunks: Vec<ChunkRecord>,
}

/// GET /files?state=active|trashed|pending
#[instrument(skip(state))]
async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<EntryState>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let files = state.manifest().list_files(filter)?;
    Ok(Json(FileList {
        total: files.len(),
        files,
    }))
}

/// GET /files/:id
#[instrument(skip(state))]
async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let file = state
        .manifest()
        .get_file(id)?
        .ok_or_else(|| NekoError::NotFound(format!("file {}", id)))?;
    let chunks = state.manifest().file_chunks(id)?;
    Ok(Json(FileDetail { file, chunks }))
}

/// GET /files/:id/content
///
/// The first chunk is decoded before the response starts so that a missing
/// shard or a corrupt first chunk still maps to a proper status code.
#[instrument(skip(state))]
async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let open = state.reader().open(id)?;
    let mut content = state.reader().stream(&open)?;

    let body = match content.next().await {
        Some(Err(e)) => return Err(e.into()),
        Some(Ok(first)) => Body::from_stream(stream::once(async { Ok(first) }).chain(content)),
        None => Body::empty(),
    };
    debug!(file_id = %id, size = open.file.size, "Streaming file");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, open.file.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"",
                open.file.name.replace(['"', '\\', '\r', '\n'], "_")
            ),
        )
        .header("x-file-digest", open.file.digest.to_hex())
        .body(body)
        .map_err(|e| NekoError::Internal(e.to_string()).into())
}

/// DELETE /files/:id
#[instrument(skip(state))]
async fn trash_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.lifecycle().trash(id)?))
}

/// POST /files/:id/restore
#[instrument(skip(state))]
async fn restore_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.lifecycle().restore(id)?))
}

/// DELETE /files/:id/purge
#[instrument(skip(state))]
async fn purge_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.lifecycle().purge(id).await?))
}
