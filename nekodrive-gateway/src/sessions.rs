//! Resumable upload sessions
//!
//! `start` hands out a capability token together with the chunk size
//! contract. Chunks may then arrive in any order and in parallel; each one
//! is digest-checked, sealed, written to the substrate and only then
//! recorded against the session. `complete` promotes the session into an
//! active file once every index is committed.

use crate::lifecycle::{discard_shards, release_shards};
use crate::state::SharedShardStore;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use nekodrive_core::{
    ChunkCodec, ContentHash, DataKind, EncryptionKey, NekoError, Result, ShardLocator,
};
use nekodrive_metadata::{
    CommitOutcome, CreateSession, FileRecord, ManifestStore, SessionState, UploadSession,
};
use nekodrive_storage::ShardStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Request to open an upload session
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUpload {
    pub name: String,
    pub size: u64,
    /// Reuse a caller-chosen id, e.g. to retry an expired upload
    #[serde(default)]
    pub file_id: Option<Uuid>,
}

/// Capability and chunking contract returned by `start`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    pub token: String,
    pub file_id: Uuid,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub expires_at: DateTime<Utc>,
}

/// What a client needs to pick an interrupted upload back up
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeView {
    pub token: String,
    pub file_id: Uuid,
    pub name: String,
    pub state: SessionState,
    pub declared_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub committed: Vec<u32>,
    pub missing: Vec<u32>,
    pub committed_bytes: u64,
    pub expires_at: DateTime<Utc>,
}

impl From<&UploadSession> for ResumeView {
    fn from(s: &UploadSession) -> Self {
        Self {
            token: s.token.clone(),
            file_id: s.file_id,
            name: s.name.clone(),
            state: s.state,
            declared_size: s.declared_size,
            chunk_size: s.chunk_size,
            chunk_count: s.chunk_count,
            committed: s.committed.iter().copied().collect(),
            missing: s.missing(),
            committed_bytes: s.committed_bytes(),
            expires_at: s.expires_at,
        }
    }
}

/// Acknowledgement of one chunk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub index: u32,
    /// The chunk was already committed with the same digest
    pub duplicate: bool,
    pub committed_chunks: u32,
    pub remaining_chunks: u32,
    pub expires_at: DateTime<Utc>,
}

impl ChunkReceipt {
    fn new(index: u32, duplicate: bool, session: &UploadSession) -> Self {
        let committed = session.committed.len() as u32;
        Self {
            index,
            duplicate,
            committed_chunks: committed,
            remaining_chunks: session.chunk_count.saturating_sub(committed),
            expires_at: session.expires_at,
        }
    }
}

/// Per-session concurrency controls
struct SessionSlot {
    /// Serializes commits to the committed set
    commit: tokio::sync::Mutex<()>,
    /// Bounds shard uploads in flight
    uploads: Semaphore,
}

/// Upload session state machine over the manifest and the shard store
pub struct SessionManager {
    manifest: Arc<ManifestStore>,
    shards: SharedShardStore,
    codec: ChunkCodec,
    master_key: EncryptionKey,
    ttl: chrono::Duration,
    max_parallel: usize,
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionManager {
    pub fn new(
        manifest: Arc<ManifestStore>,
        shards: SharedShardStore,
        codec: ChunkCodec,
        master_key: EncryptionKey,
        ttl: chrono::Duration,
        max_parallel: usize,
    ) -> Self {
        Self {
            manifest,
            shards,
            codec,
            master_key,
            ttl,
            max_parallel: max_parallel.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    /// Open a session for a new file.
    ///
    /// An expired session still holding the requested file id is reclaimed
    /// first; a live one is a conflict.
    #[instrument(skip(self, req), fields(name = %req.name, size = req.size))]
    pub async fn start(&self, req: StartUpload) -> Result<UploadTicket> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(NekoError::InvalidRequest("file name is required".to_string()));
        }
        let chunk_count = self.codec.chunk_count(req.size)?;
        let file_id = req.file_id.unwrap_or_else(Uuid::new_v4);

        if let Some(previous) = self.manifest.session_for_file(file_id)? {
            if previous.is_expired(Utc::now()) {
                self.reclaim(&previous.token).await?;
            }
        }

        let session = self.manifest.create_session(CreateSession {
            token: new_token(),
            file_id,
            name: name.to_string(),
            declared_size: req.size,
            chunk_size: self.codec.chunk_size() as u32,
            chunk_count,
            ttl: self.ttl,
        })?;

        counter!("uploads_started_total").increment(1);
        Ok(UploadTicket {
            token: session.token,
            file_id: session.file_id,
            chunk_size: session.chunk_size,
            chunk_count: session.chunk_count,
            expires_at: session.expires_at,
        })
    }

    /// Committed and missing indices of a live session
    pub fn resume(&self, token: &str) -> Result<ResumeView> {
        let session = self.live_session(token)?;
        Ok(ResumeView::from(&session))
    }

    /// Verify, seal, store and record one chunk.
    ///
    /// The body is checked against `expected` before any shard is written.
    /// The shard is written before it is recorded; if recording fails, or
    /// another request committed the same chunk first, the new shard is
    /// released again.
    #[instrument(skip(self, token, body, expected), fields(len = body.len()))]
    pub async fn put_chunk(
        &self,
        token: &str,
        index: u32,
        body: Bytes,
        expected: ContentHash,
    ) -> Result<ChunkReceipt> {
        let session = self.live_session(token)?;
        if session.state == SessionState::Completing {
            return Err(NekoError::Conflict("upload is completing".to_string()));
        }
        if index >= session.chunk_count {
            return Err(NekoError::InvalidSequence {
                index,
                count: session.chunk_count,
            });
        }

        let expected_len = self.codec.expected_len(session.declared_size, index)?;
        if body.len() != expected_len {
            return Err(NekoError::InvalidRequest(format!(
                "chunk {} must be {} bytes, got {}",
                index,
                expected_len,
                body.len()
            )));
        }
        if !expected.verify(&body) {
            return Err(NekoError::Integrity(format!(
                "chunk {} does not match its declared digest",
                index
            )));
        }

        // Skip the substrate round trip for a retried chunk
        if let Some(existing) = self.manifest.get_chunk(session.file_id, index)? {
            if existing.digest == expected {
                debug!(file_id = %session.file_id, index, "Chunk already committed");
                counter!("chunks_duplicate_total").increment(1);
                return Ok(ChunkReceipt::new(index, true, &session));
            }
            return Err(NekoError::Conflict(format!(
                "chunk {} already committed with a different digest",
                index
            )));
        }

        let slot = self.slot(token);
        let _permit = slot
            .uploads
            .acquire()
            .await
            .map_err(|e| NekoError::Internal(e.to_string()))?;

        let started = Instant::now();
        let file_key = self.master_key.derive_file_key(session.file_id);
        let codec = self.codec;
        let file_id = session.file_id;
        let encoded = tokio::task::spawn_blocking(move || {
            codec.encode_chunk(&file_key, file_id, index, &body)
        })
        .await
        .map_err(|e| NekoError::Internal(e.to_string()))??;

        let locator = self.shards.put(encoded.ciphertext.clone()).await?;
        let record = encoded.to_record(file_id, locator.clone(), DataKind::User);

        let outcome = {
            let _commit = slot.commit.lock().await;
            self.manifest.commit_chunk(token, &record, self.ttl)
        };

        match outcome {
            Ok(CommitOutcome::Committed(session)) => {
                counter!("chunks_committed_total").increment(1);
                counter!("upload_bytes_total").increment(record.plaintext_len as u64);
                histogram!("chunk_upload_duration_seconds").record(started.elapsed().as_secs_f64());
                Ok(ChunkReceipt::new(index, false, &session))
            }
            Ok(CommitOutcome::AlreadyCommitted(session)) => {
                self.discard(vec![locator]).await;
                counter!("chunks_duplicate_total").increment(1);
                Ok(ChunkReceipt::new(index, true, &session))
            }
            Err(e) => {
                self.discard(vec![locator]).await;
                if matches!(e, NekoError::SessionExpired(_) | NekoError::NotFound(_)) {
                    self.forget(token);
                }
                Err(e)
            }
        }
    }

    /// Promote a fully committed session into an active file
    #[instrument(skip(self, token))]
    pub async fn complete(&self, token: &str) -> Result<FileRecord> {
        // Unknown tokens never get a slot
        self.live_session(token)?;
        let slot = self.slot(token);
        let _commit = slot.commit.lock().await;

        let session = match self.live_session(token) {
            Ok(session) => session,
            Err(e) => {
                self.forget(token);
                return Err(e);
            }
        };
        if !session.is_complete() {
            return Err(NekoError::IncompleteUpload {
                missing: session.missing(),
            });
        }

        self.manifest.set_session_state(token, SessionState::Completing)?;

        match self.manifest.promote_session(token) {
            Ok(file) => {
                self.forget(token);
                counter!("uploads_completed_total").increment(1);
                info!(
                    file_id = %file.id,
                    name = %file.name,
                    size = file.size,
                    chunks = file.chunk_count,
                    "Upload completed"
                );
                Ok(file)
            }
            Err(e) => {
                // Reopen the session unless it is gone or expired
                if matches!(e, NekoError::NotFound(_) | NekoError::SessionExpired(_)) {
                    self.forget(token);
                } else {
                    let reopen = self
                        .manifest
                        .set_session_state(token, SessionState::AcceptingChunks);
                    if let Err(revert) = reopen {
                        warn!(error = %revert, "Failed to reopen session after failed completion");
                    }
                }
                Err(e)
            }
        }
    }

    /// Expire a session early; its shards are reclaimed by the next sweep
    #[instrument(skip(self, token))]
    pub fn abort(&self, token: &str) -> Result<()> {
        let session = self
            .manifest
            .set_session_state(token, SessionState::Expired)?;
        self.forget(token);
        info!(file_id = %session.file_id, "Upload aborted");
        Ok(())
    }

    /// Drop the concurrency slot of a session that no longer exists
    pub fn forget(&self, token: &str) {
        self.slots.lock().remove(token);
    }

    /// Drop every concurrency slot
    pub fn forget_all(&self) {
        self.slots.lock().clear();
    }

    fn live_session(&self, token: &str) -> Result<UploadSession> {
        let session = self
            .manifest
            .get_session(token)?
            .ok_or_else(|| NekoError::NotFound("upload session".to_string()))?;
        if session.is_expired(Utc::now()) {
            return Err(NekoError::SessionExpired(format!(
                "upload of file {}",
                session.file_id
            )));
        }
        Ok(session)
    }

    fn slot(&self, token: &str) -> Arc<SessionSlot> {
        self.slots
            .lock()
            .entry(token.to_string())
            .or_insert_with(|| {
                Arc::new(SessionSlot {
                    commit: tokio::sync::Mutex::new(()),
                    uploads: Semaphore::new(self.max_parallel),
                })
            })
            .clone()
    }

    async fn reclaim(&self, token: &str) -> Result<()> {
        let locators = match self.manifest.remove_session(token) {
            Ok(l) => l,
            Err(NekoError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.forget(token);
        release_shards(&self.manifest, &self.shards, locators).await?;
        Ok(())
    }

    async fn discard(&self, locators: Vec<ShardLocator>) {
        if let Err(e) = discard_shards(&self.manifest, &self.shards, locators).await {
            warn!(error = %e, "Failed to queue unrecorded shard for deletion");
        }
    }
}

/// 256-bit random capability token, URL-safe
fn new_token() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
