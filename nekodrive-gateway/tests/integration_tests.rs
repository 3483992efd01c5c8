//! Integration tests for the NekoDrive gateway
//!
//! Drives the engine services and the HTTP router over a temporary manifest
//! and the in-memory substrate.
//! Run with: cargo test --test integration_tests -p nekodrive-gateway

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use nekodrive_core::{ContentHash, EncryptionKey, NekoError, MIN_CHUNK_SIZE};
use nekodrive_gateway::config::ServerSettings;
use nekodrive_gateway::{
    app, cors_layer, AppState, GatewayConfig, StartUpload, CHUNK_DIGEST_HEADER,
};
use nekodrive_metadata::{FileRecord, FileState, ManifestStore};
use nekodrive_storage::{MemoryShardStore, ShardStore};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const CHUNK: usize = MIN_CHUNK_SIZE;

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.storage.chunk_size = CHUNK;
    config.substrate.max_attempts = 3;
    config.substrate.base_delay_ms = 1;
    config.substrate.max_delay_ms = 5;
    config.maintenance.snapshot_depth = 3;
    config
}

fn setup() -> (Arc<AppState>, Arc<MemoryShardStore>) {
    let memory = Arc::new(MemoryShardStore::new());
    let substrate: Arc<dyn ShardStore> = memory.clone();
    let state = AppState::with_parts(
        config(),
        ManifestStore::open_temporary().expect("temporary manifest"),
        substrate,
        EncryptionKey::generate(),
    )
    .expect("state");
    (Arc::new(state), memory)
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn chunk(data: &[u8], index: usize) -> Bytes {
    let start = index * CHUNK;
    let end = (start + CHUNK).min(data.len());
    Bytes::copy_from_slice(&data[start..end])
}

async fn start(state: &AppState, name: &str, size: usize) -> String {
    state
        .sessions()
        .start(StartUpload {
            name: name.to_string(),
            size: size as u64,
            file_id: None,
        })
        .await
        .expect("start upload")
        .token
}

async fn put(state: &AppState, token: &str, data: &[u8], index: usize) {
    let body = chunk(data, index);
    let digest = ContentHash::compute(&body);
    state
        .sessions()
        .put_chunk(token, index as u32, body, digest)
        .await
        .expect("put chunk");
}

async fn upload(state: &AppState, name: &str, data: &[u8]) -> FileRecord {
    let token = start(state, name, data.len()).await;
    for index in 0..data.len().div_ceil(CHUNK) {
        put(state, &token, data, index).await;
    }
    state.sessions().complete(&token).await.expect("complete")
}

async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app(state.clone()).oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, body)
}

fn json(body: &Bytes) -> Value {
    serde_json::from_slice(body).expect("json body")
}

// ============================================================================
// Resumable Upload Tests
// ============================================================================

#[tokio::test]
async fn test_resumed_upload_commits_contiguous_file() {
    let (state, _memory) = setup();
    let data = payload(2 * CHUNK + 1000, 7);
    let token = start(&state, "video.mkv", data.len()).await;

    // Client uploads 0 and 2, then drops
    put(&state, &token, &data, 0).await;
    put(&state, &token, &data, 2).await;

    let view = state.sessions().resume(&token).unwrap();
    assert_eq!(view.committed, vec![0, 2]);
    assert_eq!(view.missing, vec![1]);

    put(&state, &token, &data, 1).await;
    let file = state.sessions().complete(&token).await.unwrap();

    assert_eq!(file.chunk_count, 3);
    assert_eq!(file.size, data.len() as u64);
    let chunks = state.manifest().file_chunks(file.id).unwrap();
    let indices: Vec<u32> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    let read = state.reader().read_all(file.id).await.unwrap();
    assert_eq!(read.as_ref(), data.as_slice());

    // Session is gone once promoted
    assert!(state.manifest().get_session(&token).unwrap().is_none());
}

#[tokio::test]
async fn test_retried_chunk_is_idempotent_and_conflicting_chunk_rejected() {
    let (state, memory) = setup();
    let data = payload(2 * CHUNK, 1);
    let token = start(&state, "a.bin", data.len()).await;

    put(&state, &token, &data, 0).await;
    let shards_after_first = memory.len();

    let body = chunk(&data, 0);
    let receipt = state
        .sessions()
        .put_chunk(&token, 0, body.clone(), ContentHash::compute(&body))
        .await
        .unwrap();
    assert!(receipt.duplicate);
    assert_eq!(memory.len(), shards_after_first);

    let other = Bytes::from(payload(CHUNK, 99));
    let err = state
        .sessions()
        .put_chunk(&token, 0, other.clone(), ContentHash::compute(&other))
        .await
        .unwrap_err();
    assert!(matches!(err, NekoError::Conflict(_)));
    assert_eq!(memory.len(), shards_after_first);
}

#[tokio::test]
async fn test_complete_with_missing_chunks_reports_them() {
    let (state, _memory) = setup();
    let data = payload(3 * CHUNK, 3);
    let token = start(&state, "partial.bin", data.len()).await;
    put(&state, &token, &data, 1).await;

    match state.sessions().complete(&token).await {
        Err(NekoError::IncompleteUpload { missing }) => assert_eq!(missing, vec![0, 2]),
        other => panic!("expected IncompleteUpload, got {:?}", other),
    }

    // Session still accepts the missing chunks afterwards
    put(&state, &token, &data, 0).await;
    put(&state, &token, &data, 2).await;
    assert!(state.sessions().complete(&token).await.is_ok());
}

#[tokio::test]
async fn test_aborted_session_is_swept_with_its_shards() {
    let (state, memory) = setup();
    let data = payload(2 * CHUNK, 5);
    let token = start(&state, "abandoned.bin", data.len()).await;
    put(&state, &token, &data, 0).await;
    assert_eq!(memory.len(), 1);

    state.sessions().abort(&token).unwrap();
    let err = state.sessions().resume(&token).unwrap_err();
    assert!(matches!(err, NekoError::SessionExpired(_)));

    let report = state.sweep_orphans(false).await.unwrap();
    assert_eq!(report.sessions_removed, 1);
    assert_eq!(report.shards_deleted, 1);
    assert!(memory.is_empty());
    assert!(state.manifest().get_session(&token).unwrap().is_none());
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_trash_and_restore_keep_chunks() {
    let (state, _memory) = setup();
    let file = upload(&state, "doc.pdf", &payload(CHUNK + 10, 2)).await;
    let before = state.manifest().file_chunks(file.id).unwrap();

    let trashed = state.lifecycle().trash(file.id).unwrap();
    assert_eq!(trashed.state, FileState::Trashed);
    assert!(trashed.trashed_at.is_some());
    assert!(matches!(
        state.reader().read_all(file.id).await,
        Err(NekoError::Conflict(_))
    ));

    let restored = state.lifecycle().restore(file.id).unwrap();
    assert_eq!(restored.state, FileState::Active);
    assert_eq!(state.manifest().file_chunks(file.id).unwrap(), before);
    assert!(state.reader().read_all(file.id).await.is_ok());
}

#[tokio::test]
async fn test_purge_during_outage_is_finished_by_gc() {
    let (state, memory) = setup();
    let file = upload(&state, "old.log", &payload(2 * CHUNK, 4)).await;
    state.lifecycle().trash(file.id).unwrap();

    memory.set_outage(true);
    let report = state.lifecycle().purge(file.id).await.unwrap();
    assert_eq!(report.shards_released, 2);
    assert_eq!(report.shards_pending, 2);

    // Metadata is gone even though the shards are not
    assert!(state.manifest().get_file(file.id).unwrap().is_none());
    assert_eq!(memory.len(), 2);

    memory.set_outage(false);
    let gc = state.lifecycle().retry_gc().await.unwrap();
    assert_eq!(gc.deleted, 2);
    assert_eq!(gc.backlog, 0);
    assert!(memory.is_empty());
}

#[tokio::test]
async fn test_tampered_shard_yields_no_plaintext() {
    let (state, memory) = setup();
    let file = upload(&state, "secret.txt", &payload(2 * CHUNK, 8)).await;
    let chunks = state.manifest().file_chunks(file.id).unwrap();
    assert!(memory.tamper(&chunks[1].locator, |bytes| bytes[0] ^= 0x01));

    let err = state.reader().read_all(file.id).await.unwrap_err();
    assert!(matches!(err, NekoError::Integrity(_)));
}

// ============================================================================
// Snapshot Tests
// ============================================================================

#[tokio::test]
async fn test_snapshot_rotation_is_bounded() {
    let (state, _memory) = setup();
    upload(&state, "a.bin", &payload(100, 1)).await;

    let mut slots = Vec::new();
    for _ in 0..5 {
        slots.push(state.lifecycle().snapshot().await.unwrap().slot);
    }

    let snapshots = state.manifest().list_snapshots().unwrap();
    assert_eq!(snapshots.len(), 3);
    assert!(slots.iter().all(|slot| *slot < 3));
}

#[tokio::test]
async fn test_restore_snapshot_reproduces_manifest() {
    let (state, _memory) = setup();
    let data = payload(CHUNK + 500, 6);
    let kept = upload(&state, "kept.bin", &data).await;
    let snapshot = state.lifecycle().snapshot().await.unwrap();

    // Diverge: a new file and a pending session
    let later = upload(&state, "later.bin", &payload(300, 9)).await;
    let token = start(&state, "pending.bin", 10).await;

    let summary = state.restore_snapshot(snapshot.id).await.unwrap();
    assert_eq!(summary.files, 1);
    assert_eq!(summary.sessions_dropped, 1);

    assert_eq!(state.manifest().get_file(kept.id).unwrap(), Some(kept.clone()));
    assert!(state.manifest().get_file(later.id).unwrap().is_none());
    assert!(state.manifest().get_session(&token).unwrap().is_none());
    assert_eq!(state.manifest().list_snapshots().unwrap().len(), 1);

    let read = state.reader().read_all(kept.id).await.unwrap();
    assert_eq!(read.as_ref(), data.as_slice());
}

// ============================================================================
// HTTP API Tests
// ============================================================================

#[tokio::test]
async fn test_http_upload_download_roundtrip() {
    let (state, _memory) = setup();
    let data = payload(CHUNK + 123, 11);

    let (status, body) = send(
        &state,
        Request::post("/upload/session")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "name": "photo.jpg", "size": data.len() }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let ticket = json(&body);
    let token = ticket["token"].as_str().unwrap().to_string();
    assert_eq!(ticket["chunkCount"], 2);

    for index in 0..2 {
        let part = chunk(&data, index);
        let (status, body) = send(
            &state,
            Request::put(format!("/upload/session/{}/chunk/{}", token, index))
                .header(CHUNK_DIGEST_HEADER, ContentHash::compute(&part).to_hex())
                .body(Body::from(part))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    }

    let (status, body) = send(
        &state,
        Request::post(format!("/upload/session/{}/complete", token))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = json(&body)["id"].as_str().unwrap().to_string();

    let response = app(state.clone())
        .oneshot(
            Request::get(format!("/files/{}/content", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-length"].to_str().unwrap(),
        data.len().to_string()
    );
    let content = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(content.as_ref(), data.as_slice());

    let (status, body) = send(&state, Request::get("/files").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["total"], 1);
}

#[tokio::test]
async fn test_http_error_statuses() {
    let (state, _memory) = setup();
    let data = payload(2 * CHUNK, 12);
    let token = start(&state, "x.bin", data.len()).await;

    // Missing digest header
    let (status, _) = send(
        &state,
        Request::put(format!("/upload/session/{}/chunk/0", token))
            .body(Body::from(chunk(&data, 0)))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Digest mismatch
    let (status, body) = send(
        &state,
        Request::put(format!("/upload/session/{}/chunk/0", token))
            .header(CHUNK_DIGEST_HEADER, ContentHash::compute(b"other").to_hex())
            .body(Body::from(chunk(&data, 0)))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json(&body)["error"], "IntegrityError");

    // Index past the end
    let part = chunk(&data, 1);
    let (status, _) = send(
        &state,
        Request::put(format!("/upload/session/{}/chunk/5", token))
            .header(CHUNK_DIGEST_HEADER, ContentHash::compute(&part).to_hex())
            .body(Body::from(part))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Incomplete
    let (status, body) = send(
        &state,
        Request::post(format!("/upload/session/{}/complete", token))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json(&body)["missing"], serde_json::json!([0, 1]));

    // Unknown session, unknown file
    let (status, _) = send(
        &state,
        Request::get("/upload/session/nope").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &state,
        Request::get(format!("/files/{}", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Aborted session
    state.sessions().abort(&token).unwrap();
    let (status, _) = send(
        &state,
        Request::get(format!("/upload/session/{}", token))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);

    // Unknown listing filter
    let (status, _) = send(
        &state,
        Request::get("/files?state=bogus").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_http_trash_purge_flow() {
    let (state, memory) = setup();
    let file = upload(&state, "bye.txt", &payload(500, 13)).await;

    let (status, _) = send(
        &state,
        Request::delete(format!("/files/{}/purge", file.id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &state,
        Request::delete(format!("/files/{}", file.id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["state"], "trashed");

    let (status, body) = send(
        &state,
        Request::get("/files?state=trashed").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["total"], 1);

    let (status, _) = send(
        &state,
        Request::delete(format!("/files/{}/purge", file.id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(memory.is_empty());
}

#[tokio::test]
async fn test_http_system_endpoints() {
    let (state, _memory) = setup();
    upload(&state, "one.bin", &payload(1000, 14)).await;

    let (status, body) = send(
        &state,
        Request::get("/system/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let health = json(&body);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["database"], "online");
    assert_eq!(health["discord"], "online");

    let (status, body) = send(
        &state,
        Request::get("/system/stats").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let stats = json(&body);
    assert_eq!(stats["storage"]["totalFiles"], 1);
    assert_eq!(stats["storage"]["totalSize"], 1000);

    let (status, body) = send(
        &state,
        Request::post("/system/backup").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let snapshot_id = json(&body)["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &state,
        Request::get("/system/snapshots").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body).as_array().unwrap().len(), 1);

    let (status, body) = send(
        &state,
        Request::post(format!("/system/restore/{}", snapshot_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["files"], 1);
}

#[tokio::test]
async fn test_cors_allows_only_configured_origins() {
    let (state, _memory) = setup();

    let preflight = |origin: &str| {
        Request::builder()
            .method("OPTIONS")
            .uri("/upload/session")
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap()
    };
    let allowed_origin = |server: &ServerSettings, origin: &str| {
        let router = app(state.clone()).layer(cors_layer(server).expect("cors"));
        let request = preflight(origin);
        async move {
            let response = router.oneshot(request).await.expect("response");
            response
                .headers()
                .get("access-control-allow-origin")
                .map(|v| v.to_str().unwrap().to_string())
        }
    };

    // Default: no origin is let through
    let mut server = ServerSettings::default();
    assert_eq!(allowed_origin(&server, "https://evil.example").await, None);

    server.cors_origins = vec!["https://drive.example".into()];
    assert_eq!(
        allowed_origin(&server, "https://drive.example").await.as_deref(),
        Some("https://drive.example")
    );
    assert_eq!(allowed_origin(&server, "https://evil.example").await, None);

    server.cors_permissive = true;
    assert_eq!(
        allowed_origin(&server, "https://evil.example").await.as_deref(),
        Some("*")
    );
}
