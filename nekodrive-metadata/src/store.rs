//! Sled-backed manifest store
//!
//! The manifest is the single source of truth for files, chunk placement,
//! upload sessions, pending shard deletions and snapshots. Every mutation
//! that touches more than one row runs in one multi-tree sled transaction,
//! so a crash never leaves a half-promoted upload or a file whose chunks are
//! gone but whose record remains.
//!
//! Trees:
//! - `files`: file id -> [`FileRecord`]
//! - `chunks`: file id ‖ index (BE) -> [`ChunkRecord`]
//! - `sessions`: token -> [`UploadSession`]
//! - `file_sessions`: file id -> token
//! - `shard_gc`: locator -> [`GcEntry`]
//! - `snapshots`: slot (BE) -> [`SnapshotRecord`]

use crate::export::{ManifestContents, ManifestExport};
use crate::models::*;
use chrono::{DateTime, Duration, Utc};
use nekodrive_core::chunk::{chunk_key, verify_contiguous};
use nekodrive_core::codec::FileDigest;
use nekodrive_core::{ChunkRecord, NekoError, Result, ShardLocator};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionResult, TransactionalTree,
};
use sled::Transactional;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Manifest storage failures
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl From<ManifestError> for NekoError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Sled(e) => NekoError::Storage(e.to_string()),
            ManifestError::Encoding(e) => NekoError::Serialization(e.to_string()),
        }
    }
}

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<NekoError>>;

fn abort<T>(err: NekoError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn tx_encode<V: Serialize>(value: &V) -> TxResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn tx_get<V: DeserializeOwned>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<V>> {
    match tree.get(key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| ConflictableTransactionError::Abort(e.into())),
        None => Ok(None),
    }
}

/// Queue a shard for deletion unless it is already queued
fn tx_enqueue_gc(tree: &TransactionalTree, locator: &ShardLocator) -> TxResult<()> {
    let key = locator.as_str().as_bytes();
    if tree.get(key)?.is_none() {
        tree.insert(key, tx_encode(&GcEntry::new(locator.clone()))?)?;
    }
    Ok(())
}

fn finish<T>(result: TransactionResult<T, NekoError>) -> Result<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => ManifestError::Sled(e).into(),
    })
}

fn slot_key(slot: u32) -> [u8; 4] {
    slot.to_be_bytes()
}

/// Sled-backed manifest
pub struct ManifestStore {
    db: sled::Db,
    files: sled::Tree,
    chunks: sled::Tree,
    sessions: sled::Tree,
    file_sessions: sled::Tree,
    shard_gc: sled::Tree,
    snapshots: sled::Tree,

    /// Mutations hold this shared; export and restore hold it exclusively
    gate: RwLock<()>,
}

impl ManifestStore {
    /// Open or create a manifest
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening manifest store");
        let db = sled::open(path.as_ref()).map_err(ManifestError::from)?;
        Self::from_db(db)
    }

    /// Open an in-memory manifest (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(ManifestError::from)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = |name: &str| db.open_tree(name).map_err(ManifestError::from);
        Ok(Self {
            files: tree("files")?,
            chunks: tree("chunks")?,
            sessions: tree("sessions")?,
            file_sessions: tree("file_sessions")?,
            shard_gc: tree("shard_gc")?,
            snapshots: tree("snapshots")?,
            gate: RwLock::new(()),
            db,
        })
    }

    fn get_value<V: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> Result<Option<V>> {
        match tree.get(key).map_err(ManifestError::from)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn values<V: DeserializeOwned>(iter: sled::Iter) -> Result<Vec<V>> {
        let mut out = Vec::new();
        for item in iter {
            let (_, value) = item.map_err(ManifestError::from)?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    // ===== Upload Sessions =====

    /// Register a new upload session for a file id nobody holds yet
    pub fn create_session(&self, params: CreateSession) -> Result<UploadSession> {
        let _gate = self.gate.read();
        let session = params.into_session(Utc::now());
        let encoded = bincode::serialize(&session)?;
        let file_key = session.file_id.as_bytes().to_vec();
        let token = session.token.as_bytes();

        let result = (&self.files, &self.sessions, &self.file_sessions).transaction(
            |(files, sessions, file_sessions)| -> TxResult<()> {
                if files.get(&file_key[..])?.is_some() {
                    return abort(NekoError::Conflict(format!(
                        "file {} already exists",
                        session.file_id
                    )));
                }
                if file_sessions.get(&file_key[..])?.is_some() {
                    return abort(NekoError::Conflict(format!(
                        "file {} already has an upload session",
                        session.file_id
                    )));
                }
                if sessions.get(token)?.is_some() {
                    return abort(NekoError::Conflict("session token collision".to_string()));
                }
                sessions.insert(token, encoded.clone())?;
                file_sessions.insert(&file_key[..], token)?;
                Ok(())
            },
        );
        finish(result)?;

        info!(
            file_id = %session.file_id,
            size = session.declared_size,
            chunks = session.chunk_count,
            "Upload session created"
        );
        Ok(session)
    }

    pub fn get_session(&self, token: &str) -> Result<Option<UploadSession>> {
        Self::get_value(&self.sessions, token.as_bytes())
    }

    /// Session currently targeting a file id, if any
    pub fn session_for_file(&self, file_id: Uuid) -> Result<Option<UploadSession>> {
        match self
            .file_sessions
            .get(file_id.as_bytes())
            .map_err(ManifestError::from)?
        {
            Some(token) => Self::get_value(&self.sessions, &token),
            None => Ok(None),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<UploadSession>> {
        Self::values(self.sessions.iter())
    }

    /// Apply `f` to a session atomically and return the updated session
    pub fn update_session<F>(&self, token: &str, f: F) -> Result<UploadSession>
    where
        F: Fn(&mut UploadSession) -> Result<()>,
    {
        let _gate = self.gate.read();
        let key = token.as_bytes();
        let result = self.sessions.transaction(|tx| -> TxResult<UploadSession> {
            let mut session: UploadSession = match tx_get(tx, key)? {
                Some(s) => s,
                None => return abort(NekoError::NotFound("upload session".to_string())),
            };
            f(&mut session).map_err(ConflictableTransactionError::Abort)?;
            session.updated_at = Utc::now();
            tx.insert(key, tx_encode(&session)?)?;
            Ok(session)
        });
        finish(result)
    }

    pub fn set_session_state(&self, token: &str, state: SessionState) -> Result<UploadSession> {
        let session = self.update_session(token, |s| {
            s.state = state;
            Ok(())
        })?;
        debug!(file_id = %session.file_id, state = %state, "Session state changed");
        Ok(session)
    }

    /// Record a stored chunk against a session.
    ///
    /// Same index with the same digest is a no-op; a different digest is a
    /// conflict. Each commit slides the session expiry forward by `ttl`.
    pub fn commit_chunk(
        &self,
        token: &str,
        record: &ChunkRecord,
        ttl: Duration,
    ) -> Result<CommitOutcome> {
        let _gate = self.gate.read();
        let now = Utc::now();
        let key = token.as_bytes();
        let chunk = record.key();
        let encoded = bincode::serialize(record)?;

        let result = (&self.sessions, &self.chunks).transaction(
            |(sessions, chunks)| -> TxResult<CommitOutcome> {
                let mut session: UploadSession = match tx_get(sessions, key)? {
                    Some(s) => s,
                    None => return abort(NekoError::NotFound("upload session".to_string())),
                };
                if session.is_expired(now) {
                    return abort(NekoError::SessionExpired(format!(
                        "upload of file {}",
                        session.file_id
                    )));
                }
                if session.state == SessionState::Completing {
                    return abort(NekoError::Conflict("upload is completing".to_string()));
                }
                if session.file_id != record.file_id {
                    return abort(NekoError::InvalidRequest(format!(
                        "chunk belongs to file {}",
                        record.file_id
                    )));
                }
                if record.index >= session.chunk_count {
                    return abort(NekoError::InvalidSequence {
                        index: record.index,
                        count: session.chunk_count,
                    });
                }

                if let Some(existing) = tx_get::<ChunkRecord>(chunks, &chunk[..])? {
                    if existing.digest == record.digest
                        && existing.plaintext_len == record.plaintext_len
                    {
                        return Ok(CommitOutcome::AlreadyCommitted(session));
                    }
                    return abort(NekoError::Conflict(format!(
                        "chunk {} already committed with a different digest",
                        record.index
                    )));
                }

                chunks.insert(&chunk[..], encoded.clone())?;
                session.committed.insert(record.index);
                session.state = SessionState::AcceptingChunks;
                session.updated_at = now;
                session.expires_at = now + ttl;
                sessions.insert(key, tx_encode(&session)?)?;
                Ok(CommitOutcome::Committed(session))
            },
        );
        let outcome = finish(result)?;

        if let CommitOutcome::Committed(session) = &outcome {
            debug!(
                file_id = %session.file_id,
                index = record.index,
                committed = session.committed.len(),
                "Chunk committed"
            );
        }
        Ok(outcome)
    }

    /// Turn a completing session into an active file, in one transaction
    pub fn promote_session(&self, token: &str) -> Result<FileRecord> {
        let _gate = self.gate.read();
        let now = Utc::now();
        let key = token.as_bytes();

        let result = (&self.files, &self.chunks, &self.sessions, &self.file_sessions).transaction(
            |(files, chunks, sessions, file_sessions)| -> TxResult<FileRecord> {
                let session: UploadSession = match tx_get(sessions, key)? {
                    Some(s) => s,
                    None => return abort(NekoError::NotFound("upload session".to_string())),
                };
                if now >= session.expires_at || session.state == SessionState::Expired {
                    return abort(NekoError::SessionExpired(format!(
                        "upload of file {}",
                        session.file_id
                    )));
                }
                if session.state != SessionState::Completing {
                    return abort(NekoError::Conflict(format!(
                        "session is {}, not completing",
                        session.state
                    )));
                }

                let mut records = Vec::with_capacity(session.chunk_count as usize);
                for index in 0..session.chunk_count {
                    let k = chunk_key(session.file_id, index);
                    if let Some(record) = tx_get::<ChunkRecord>(chunks, &k[..])? {
                        records.push(record);
                    }
                }
                verify_contiguous(&records, session.chunk_count)
                    .map_err(ConflictableTransactionError::Abort)?;

                let size: u64 = records.iter().map(|r| r.plaintext_len as u64).sum();
                if size != session.declared_size {
                    return abort(NekoError::Integrity(format!(
                        "committed {} bytes, declared {}",
                        size, session.declared_size
                    )));
                }
                let digest =
                    FileDigest::of_records(&records).map_err(ConflictableTransactionError::Abort)?;

                let file_key = session.file_id.as_bytes();
                if files.get(&file_key[..])?.is_some() {
                    return abort(NekoError::Conflict(format!(
                        "file {} already exists",
                        session.file_id
                    )));
                }

                let file = FileRecord {
                    id: session.file_id,
                    name: session.name.clone(),
                    size,
                    digest,
                    state: FileState::Active,
                    chunk_count: session.chunk_count,
                    chunk_size: session.chunk_size,
                    created_at: session.created_at,
                    modified_at: now,
                    trashed_at: None,
                };
                files.insert(&file_key[..], tx_encode(&file)?)?;
                sessions.remove(key)?;
                file_sessions.remove(&file_key[..])?;
                Ok(file)
            },
        );
        let file = finish(result)?;

        info!(file_id = %file.id, size = file.size, chunks = file.chunk_count, "Upload promoted");
        Ok(file)
    }

    /// Drop a session and queue all its shards for deletion.
    ///
    /// Returns the released locators so the caller can try to delete them
    /// right away.
    pub fn remove_session(&self, token: &str) -> Result<Vec<ShardLocator>> {
        let _gate = self.gate.read();
        let key = token.as_bytes();

        let result = (&self.chunks, &self.sessions, &self.file_sessions, &self.shard_gc)
            .transaction(
                |(chunks, sessions, file_sessions, shard_gc)| -> TxResult<(Uuid, Vec<ShardLocator>)> {
                    let session: UploadSession = match tx_get(sessions, key)? {
                        Some(s) => s,
                        None => return abort(NekoError::NotFound("upload session".to_string())),
                    };

                    let mut released = Vec::with_capacity(session.committed.len());
                    for &index in &session.committed {
                        let k = chunk_key(session.file_id, index);
                        if let Some(record) = tx_get::<ChunkRecord>(chunks, &k[..])? {
                            tx_enqueue_gc(shard_gc, &record.locator)?;
                            released.push(record.locator);
                        }
                        chunks.remove(&k[..])?;
                    }

                    sessions.remove(key)?;
                    let file_key = session.file_id.as_bytes();
                    if file_sessions.get(&file_key[..])?.as_deref() == Some(key) {
                        file_sessions.remove(&file_key[..])?;
                    }
                    Ok((session.file_id, released))
                },
            );
        let (file_id, released) = finish(result)?;

        info!(file_id = %file_id, shards = released.len(), "Upload session removed");
        Ok(released)
    }

    // ===== Files =====

    pub fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        Self::get_value(&self.files, id.as_bytes())
    }

    /// Chunk records of a file (or pending upload), in index order
    pub fn file_chunks(&self, id: Uuid) -> Result<Vec<ChunkRecord>> {
        Self::values(self.chunks.scan_prefix(id.as_bytes()))
    }

    pub fn get_chunk(&self, id: Uuid, index: u32) -> Result<Option<ChunkRecord>> {
        Self::get_value(&self.chunks, &chunk_key(id, index))
    }

    /// Files and pending uploads, newest modification first
    pub fn list_files(&self, filter: Option<EntryState>) -> Result<Vec<FileSummary>> {
        let wants = |state: EntryState| filter.map_or(true, |f| f == state);
        let mut entries = Vec::new();

        if wants(EntryState::Active) || wants(EntryState::Trashed) {
            for file in Self::values::<FileRecord>(self.files.iter())? {
                if wants(file.state.into()) {
                    entries.push(FileSummary::from(&file));
                }
            }
        }
        if wants(EntryState::Pending) {
            for session in self.list_sessions()? {
                entries.push(FileSummary::from(&session));
            }
        }

        entries.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(entries)
    }

    fn transition(&self, id: Uuid, from: FileState, to: FileState) -> Result<FileRecord> {
        let _gate = self.gate.read();
        let key = id.as_bytes();
        let now = Utc::now();

        let result = self.files.transaction(|files| -> TxResult<FileRecord> {
            let mut file: FileRecord = match tx_get(files, &key[..])? {
                Some(f) => f,
                None => return abort(NekoError::NotFound(format!("file {}", id))),
            };
            if file.state != from {
                return abort(NekoError::Conflict(format!("file {} is {}", id, file.state)));
            }
            file.state = to;
            file.modified_at = now;
            file.trashed_at = match to {
                FileState::Trashed => Some(now),
                FileState::Active => None,
            };
            files.insert(&key[..], tx_encode(&file)?)?;
            Ok(file)
        });
        let file = finish(result)?;

        info!(file_id = %id, state = %to, "File state changed");
        Ok(file)
    }

    /// Soft delete: active -> trashed
    pub fn move_to_trash(&self, id: Uuid) -> Result<FileRecord> {
        self.transition(id, FileState::Active, FileState::Trashed)
    }

    /// Undo a soft delete: trashed -> active
    pub fn restore(&self, id: Uuid) -> Result<FileRecord> {
        self.transition(id, FileState::Trashed, FileState::Active)
    }

    /// Remove a trashed file and its chunks; its shards are queued for
    /// deletion in the same transaction.
    pub fn purge(&self, id: Uuid) -> Result<Vec<ShardLocator>> {
        let _gate = self.gate.read();
        let key = id.as_bytes();

        let result = (&self.files, &self.chunks, &self.shard_gc).transaction(
            |(files, chunks, shard_gc)| -> TxResult<Vec<ShardLocator>> {
                let file: FileRecord = match tx_get(files, &key[..])? {
                    Some(f) => f,
                    None => return abort(NekoError::NotFound(format!("file {}", id))),
                };
                if file.state != FileState::Trashed {
                    return abort(NekoError::Conflict(format!(
                        "file {} must be trashed before purge",
                        id
                    )));
                }

                let mut released = Vec::with_capacity(file.chunk_count as usize);
                for index in 0..file.chunk_count {
                    let k = chunk_key(id, index);
                    if let Some(record) = tx_get::<ChunkRecord>(chunks, &k[..])? {
                        tx_enqueue_gc(shard_gc, &record.locator)?;
                        released.push(record.locator);
                    }
                    chunks.remove(&k[..])?;
                }
                files.remove(&key[..])?;
                Ok(released)
            },
        );
        let released = finish(result)?;

        info!(file_id = %id, shards = released.len(), "File purged");
        Ok(released)
    }

    /// Trashed files whose trash time is at or before `cutoff`
    pub fn trashed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<FileRecord>> {
        Ok(Self::values::<FileRecord>(self.files.iter())?
            .into_iter()
            .filter(|f| f.state == FileState::Trashed && f.trashed_at.map_or(false, |t| t <= cutoff))
            .collect())
    }

    // ===== Shard Garbage Collection =====

    /// Queue shards for deletion outside any file transaction
    pub fn enqueue_gc(&self, locators: &[ShardLocator]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for locator in locators {
            batch.insert(
                locator.as_str().as_bytes(),
                bincode::serialize(&GcEntry::new(locator.clone()))?,
            );
        }
        self.shard_gc
            .apply_batch(batch)
            .map_err(ManifestError::from)?;
        Ok(())
    }

    /// Oldest-key-first slice of the deletion queue
    pub fn gc_pending(&self, limit: usize) -> Result<Vec<GcEntry>> {
        let mut out = Vec::new();
        for item in self.shard_gc.iter().take(limit) {
            let (_, value) = item.map_err(ManifestError::from)?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// The shard is gone from the substrate; forget it
    pub fn gc_resolve(&self, locator: &ShardLocator) -> Result<()> {
        self.shard_gc
            .remove(locator.as_str().as_bytes())
            .map_err(ManifestError::from)?;
        Ok(())
    }

    /// Record a failed deletion attempt
    pub fn gc_record_failure(&self, locator: &ShardLocator, error: &str) -> Result<Option<GcEntry>> {
        let key = locator.as_str().as_bytes();
        let result = self.shard_gc.transaction(|tx| -> TxResult<Option<GcEntry>> {
            let mut entry: GcEntry = match tx_get(tx, key)? {
                Some(e) => e,
                None => return Ok(None),
            };
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(error.to_string());
            tx.insert(key, tx_encode(&entry)?)?;
            Ok(Some(entry))
        });
        finish(result)
    }

    pub fn gc_len(&self) -> usize {
        self.shard_gc.len()
    }

    // ===== Snapshots =====

    /// Slot the next snapshot should occupy: the first free slot, or the
    /// oldest snapshot's slot once the rotation is full.
    pub fn next_snapshot_slot(&self, depth: u32) -> Result<u32> {
        if depth == 0 {
            return Err(NekoError::Configuration(
                "snapshot rotation depth must be at least 1".to_string(),
            ));
        }
        let snapshots: Vec<SnapshotRecord> = Self::values(self.snapshots.iter())?;
        let occupied: HashSet<u32> = snapshots.iter().map(|s| s.slot).collect();

        if let Some(free) = (0..depth).find(|slot| !occupied.contains(slot)) {
            return Ok(free);
        }
        Ok(snapshots
            .iter()
            .filter(|s| s.slot < depth)
            .min_by_key(|s| s.created_at)
            .map(|s| s.slot)
            .unwrap_or(0))
    }

    /// Store a snapshot in its slot, evicting whatever occupied it and any
    /// snapshot beyond the rotation depth. Evicted shards are queued for
    /// deletion; the evicted records are returned.
    pub fn record_snapshot(
        &self,
        record: &SnapshotRecord,
        depth: u32,
    ) -> Result<Vec<SnapshotRecord>> {
        let _gate = self.gate.read();
        if record.slot >= depth {
            return Err(NekoError::InvalidRequest(format!(
                "slot {} outside rotation depth {}",
                record.slot, depth
            )));
        }

        let mut evict_slots = vec![record.slot];
        for existing in Self::values::<SnapshotRecord>(self.snapshots.iter())? {
            if existing.slot >= depth {
                evict_slots.push(existing.slot);
            }
        }
        let encoded = bincode::serialize(record)?;

        let result = (&self.snapshots, &self.shard_gc).transaction(
            |(snapshots, shard_gc)| -> TxResult<Vec<SnapshotRecord>> {
                let mut evicted = Vec::new();
                for slot in &evict_slots {
                    let k = slot_key(*slot);
                    if let Some(old) = tx_get::<SnapshotRecord>(snapshots, &k[..])? {
                        for chunk in &old.chunks {
                            tx_enqueue_gc(shard_gc, &chunk.locator)?;
                        }
                        snapshots.remove(&k[..])?;
                        evicted.push(old);
                    }
                }
                snapshots.insert(&slot_key(record.slot)[..], encoded.clone())?;
                Ok(evicted)
            },
        );
        let evicted = finish(result)?;

        info!(
            snapshot_id = %record.id,
            slot = record.slot,
            evicted = evicted.len(),
            "Snapshot recorded"
        );
        Ok(evicted)
    }

    /// Retained snapshots, newest first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        let mut snapshots: Vec<SnapshotRecord> = Self::values(self.snapshots.iter())?;
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    pub fn get_snapshot(&self, id: Uuid) -> Result<Option<SnapshotRecord>> {
        Ok(self.list_snapshots()?.into_iter().find(|s| s.id == id))
    }

    // ===== Export / Restore =====

    /// Consistent export of every committed file and its chunks
    pub fn export(&self) -> Result<ManifestExport> {
        let _gate = self.gate.write();
        let files: Vec<FileRecord> = Self::values(self.files.iter())?;
        let mut chunks = Vec::new();
        for file in &files {
            chunks.extend(self.file_chunks(file.id)?);
        }
        ManifestExport::new(ManifestContents { files, chunks })
    }

    /// Replace the live files, chunks and sessions with an export.
    ///
    /// Shards referenced only by the replaced state are queued for deletion;
    /// shards the export references are taken off the deletion queue.
    /// Snapshots are left alone.
    pub fn replace_contents(&self, export: &ManifestExport) -> Result<RestoreSummary> {
        export.verify()?;
        let contents = &export.manifest;

        let mut by_file: BTreeMap<Uuid, Vec<ChunkRecord>> = BTreeMap::new();
        for chunk in &contents.chunks {
            by_file.entry(chunk.file_id).or_default().push(chunk.clone());
        }
        let mut new_files = Vec::with_capacity(contents.files.len());
        for file in &contents.files {
            let mut records = by_file.remove(&file.id).unwrap_or_default();
            records.sort_by_key(|r| r.index);
            verify_contiguous(&records, file.chunk_count)
                .map_err(|e| NekoError::Integrity(format!("file {}: {}", file.id, e)))?;
            if FileDigest::of_records(&records)? != file.digest {
                return Err(NekoError::Integrity(format!(
                    "file {} digest does not match its chunks",
                    file.id
                )));
            }
            new_files.push((file.id.as_bytes().to_vec(), bincode::serialize(file)?));
        }
        if let Some(stray) = by_file.keys().next() {
            return Err(NekoError::Integrity(format!(
                "export has chunks for unknown file {}",
                stray
            )));
        }

        let mut new_chunks = Vec::with_capacity(contents.chunks.len());
        let mut kept: HashSet<ShardLocator> = HashSet::new();
        for chunk in &contents.chunks {
            new_chunks.push((chunk.key().to_vec(), bincode::serialize(chunk)?));
            kept.insert(chunk.locator.clone());
        }

        let _gate = self.gate.write();

        let keys = |tree: &sled::Tree| -> Result<Vec<sled::IVec>> {
            tree.iter()
                .keys()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ManifestError::from(e).into())
        };
        let old_files = keys(&self.files)?;
        let old_sessions = keys(&self.sessions)?;
        let old_file_sessions = keys(&self.file_sessions)?;
        let old_chunks: Vec<ChunkRecord> = Self::values(self.chunks.iter())?;
        let released: Vec<ShardLocator> = old_chunks
            .iter()
            .map(|c| c.locator.clone())
            .filter(|l| !kept.contains(l))
            .collect();

        let result = (
            &self.files,
            &self.chunks,
            &self.sessions,
            &self.file_sessions,
            &self.shard_gc,
        )
            .transaction(
                |(files, chunks, sessions, file_sessions, shard_gc)| -> TxResult<()> {
                    for k in &old_files {
                        files.remove(k.clone())?;
                    }
                    for c in &old_chunks {
                        chunks.remove(&c.key()[..])?;
                    }
                    for k in &old_sessions {
                        sessions.remove(k.clone())?;
                    }
                    for k in &old_file_sessions {
                        file_sessions.remove(k.clone())?;
                    }
                    for (k, v) in &new_files {
                        files.insert(k.as_slice(), v.clone())?;
                    }
                    for (k, v) in &new_chunks {
                        chunks.insert(k.as_slice(), v.clone())?;
                    }
                    for locator in &released {
                        tx_enqueue_gc(shard_gc, locator)?;
                    }
                    for locator in &kept {
                        shard_gc.remove(locator.as_str().as_bytes())?;
                    }
                    Ok(())
                },
            );
        finish(result)?;

        let summary = RestoreSummary {
            files: new_files.len() as u64,
            chunks: new_chunks.len() as u64,
            sessions_dropped: old_sessions.len() as u64,
            shards_released: released.len() as u64,
        };
        info!(
            files = summary.files,
            chunks = summary.chunks,
            released = summary.shards_released,
            "Manifest restored"
        );
        Ok(summary)
    }

    // ===== Stats =====

    pub fn stats(&self) -> Result<ManifestStats> {
        let mut stats = ManifestStats::default();
        for file in Self::values::<FileRecord>(self.files.iter())? {
            match file.state {
                FileState::Active => {
                    stats.active_files += 1;
                    stats.active_bytes += file.size;
                }
                FileState::Trashed => {
                    stats.trashed_files += 1;
                    stats.trashed_bytes += file.size;
                }
            }
        }
        for session in self.list_sessions()? {
            stats.pending_uploads += 1;
            stats.pending_bytes += session.committed_bytes();
        }
        stats.snapshots = self.snapshots.len() as u64;
        stats.gc_backlog = self.shard_gc.len() as u64;
        stats.db_size = self.size_on_disk()?;
        Ok(stats)
    }

    /// Approximate on-disk size of the manifest
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk().map_err(ManifestError::from)?)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(ManifestError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nekodrive_core::{ContentHash, DataKind};

    const CHUNK: u32 = 10;

    fn store() -> ManifestStore {
        ManifestStore::open_temporary().unwrap()
    }

    fn params(token: &str, file_id: Uuid, size: u64) -> CreateSession {
        CreateSession {
            token: token.to_string(),
            file_id,
            name: format!("{}.bin", token),
            declared_size: size,
            chunk_size: CHUNK,
            chunk_count: size.div_ceil(CHUNK as u64) as u32,
            ttl: Duration::hours(1),
        }
    }

    fn record(file_id: Uuid, index: u32, len: u32, seed: &str) -> ChunkRecord {
        ChunkRecord {
            file_id,
            index,
            plaintext_len: len,
            ciphertext_len: len + 16,
            nonce: [0; 12],
            tag: [0; 16],
            digest: ContentHash::compute(format!("{}-{}", seed, index).as_bytes()),
            locator: ShardLocator::new(format!("mem:{}-{}-{}", file_id, index, seed)),
            kind: DataKind::User,
            committed_at: Utc::now(),
        }
    }

    /// Upload and promote a file of `size` bytes
    fn committed_file(store: &ManifestStore, token: &str, size: u64) -> FileRecord {
        let id = Uuid::new_v4();
        let session = store.create_session(params(token, id, size)).unwrap();
        for index in 0..session.chunk_count {
            let len = (size - index as u64 * CHUNK as u64).min(CHUNK as u64) as u32;
            store
                .commit_chunk(token, &record(id, index, len, "a"), Duration::hours(1))
                .unwrap();
        }
        store.set_session_state(token, SessionState::Completing).unwrap();
        store.promote_session(token).unwrap()
    }

    #[test]
    fn test_session_uniqueness_per_file() {
        let store = store();
        let id = Uuid::new_v4();
        store.create_session(params("t1", id, 30)).unwrap();

        let again = store.create_session(params("t2", id, 30));
        assert!(matches!(again, Err(NekoError::Conflict(_))));
        assert_eq!(store.session_for_file(id).unwrap().unwrap().token, "t1");
    }

    #[test]
    fn test_commit_is_idempotent_and_detects_conflicts() {
        let store = store();
        let id = Uuid::new_v4();
        store.create_session(params("t", id, 30)).unwrap();

        let first = store
            .commit_chunk("t", &record(id, 1, 10, "a"), Duration::hours(1))
            .unwrap();
        assert!(matches!(first, CommitOutcome::Committed(_)));

        let again = store
            .commit_chunk("t", &record(id, 1, 10, "a"), Duration::hours(1))
            .unwrap();
        assert!(matches!(again, CommitOutcome::AlreadyCommitted(_)));

        let different = store.commit_chunk("t", &record(id, 1, 10, "b"), Duration::hours(1));
        assert!(matches!(different, Err(NekoError::Conflict(_))));

        let out_of_range = store.commit_chunk("t", &record(id, 3, 10, "a"), Duration::hours(1));
        assert!(matches!(
            out_of_range,
            Err(NekoError::InvalidSequence { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_promotion_requires_every_chunk() {
        let store = store();
        let id = Uuid::new_v4();
        store.create_session(params("t", id, 25)).unwrap();
        store
            .commit_chunk("t", &record(id, 0, 10, "a"), Duration::hours(1))
            .unwrap();
        store
            .commit_chunk("t", &record(id, 2, 5, "a"), Duration::hours(1))
            .unwrap();
        store.set_session_state("t", SessionState::Completing).unwrap();

        match store.promote_session("t") {
            Err(NekoError::IncompleteUpload { missing }) => assert_eq!(missing, vec![1]),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(store.get_file(id).unwrap().is_none());
        assert!(store.get_session("t").unwrap().is_some());
    }

    #[test]
    fn test_promotion_is_atomic() {
        let store = store();
        let file = committed_file(&store, "t", 25);

        assert_eq!(file.state, FileState::Active);
        assert_eq!(file.size, 25);
        assert_eq!(file.chunk_count, 3);
        assert!(store.get_session("t").unwrap().is_none());
        assert!(store.session_for_file(file.id).unwrap().is_none());

        let chunks = store.file_chunks(file.id).unwrap();
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(FileDigest::of_records(&chunks).unwrap(), file.digest);
    }

    #[test]
    fn test_expired_session_rejects_chunks_and_never_promotes() {
        let store = store();
        let id = Uuid::new_v4();
        store.create_session(params("t", id, 10)).unwrap();
        store
            .commit_chunk("t", &record(id, 0, 10, "a"), Duration::hours(1))
            .unwrap();
        store
            .update_session("t", |s| {
                s.expires_at = Utc::now() - Duration::seconds(1);
                Ok(())
            })
            .unwrap();

        let late = store.commit_chunk("t", &record(id, 0, 10, "a"), Duration::hours(1));
        assert!(matches!(late, Err(NekoError::SessionExpired(_))));

        store.set_session_state("t", SessionState::Completing).unwrap();
        assert!(matches!(
            store.promote_session("t"),
            Err(NekoError::SessionExpired(_))
        ));
    }

    #[test]
    fn test_remove_session_queues_shards() {
        let store = store();
        let id = Uuid::new_v4();
        store.create_session(params("t", id, 30)).unwrap();
        store
            .commit_chunk("t", &record(id, 0, 10, "a"), Duration::hours(1))
            .unwrap();
        store
            .commit_chunk("t", &record(id, 2, 10, "a"), Duration::hours(1))
            .unwrap();

        let released = store.remove_session("t").unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(store.gc_len(), 2);
        assert!(store.file_chunks(id).unwrap().is_empty());
        assert!(store.session_for_file(id).unwrap().is_none());

        // The file id is free again
        store.create_session(params("t2", id, 30)).unwrap();
    }

    #[test]
    fn test_trash_restore_purge() {
        let store = store();
        let file = committed_file(&store, "t", 25);
        let before = store.file_chunks(file.id).unwrap();

        assert!(matches!(store.purge(file.id), Err(NekoError::Conflict(_))));

        let trashed = store.move_to_trash(file.id).unwrap();
        assert_eq!(trashed.state, FileState::Trashed);
        assert!(trashed.trashed_at.is_some());
        assert!(matches!(store.move_to_trash(file.id), Err(NekoError::Conflict(_))));

        let restored = store.restore(file.id).unwrap();
        assert_eq!(restored.state, FileState::Active);
        assert!(restored.trashed_at.is_none());
        assert_eq!(store.file_chunks(file.id).unwrap(), before);

        store.move_to_trash(file.id).unwrap();
        let released = store.purge(file.id).unwrap();
        assert_eq!(released.len(), 3);
        assert!(store.get_file(file.id).unwrap().is_none());
        assert!(store.file_chunks(file.id).unwrap().is_empty());
        assert_eq!(store.gc_len(), 3);

        assert!(matches!(store.purge(file.id), Err(NekoError::NotFound(_))));
    }

    #[test]
    fn test_listing_filters_and_orders() {
        let store = store();
        let older = committed_file(&store, "a", 5);
        let newer = committed_file(&store, "b", 5);
        store.move_to_trash(older.id).unwrap();
        store
            .create_session(params("c", Uuid::new_v4(), 50))
            .unwrap();

        let all = store.list_files(None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].modified_at >= w[1].modified_at));

        let active = store.list_files(Some(EntryState::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, newer.id);

        let trashed = store.list_files(Some(EntryState::Trashed)).unwrap();
        assert_eq!(trashed[0].id, older.id);

        let pending = store.list_files(Some(EntryState::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].committed_chunks, 0);
    }

    #[test]
    fn test_gc_queue() {
        let store = store();
        let a = ShardLocator::new("mem:1");
        let b = ShardLocator::new("mem:2");
        store.enqueue_gc(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(store.gc_len(), 2);

        let entry = store.gc_record_failure(&a, "timeout").unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));

        store.gc_resolve(&a).unwrap();
        let pending = store.gc_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].locator, b);
    }

    fn snapshot(slot: u32, seed: &str) -> SnapshotRecord {
        let id = Uuid::new_v4();
        let mut chunk = record(id, 0, 10, seed);
        chunk.kind = DataKind::System;
        SnapshotRecord {
            id,
            created_at: Utc::now(),
            slot,
            file_count: 0,
            size: 10,
            digest: FileDigest::of_records(std::slice::from_ref(&chunk)).unwrap(),
            chunks: vec![chunk],
        }
    }

    #[test]
    fn test_snapshot_rotation() {
        let store = store();
        let depth = 2;

        let mut ids = Vec::new();
        for round in 0..4 {
            let slot = store.next_snapshot_slot(depth).unwrap();
            let snap = snapshot(slot, &format!("s{}", round));
            let evicted = store.record_snapshot(&snap, depth).unwrap();
            if round < 2 {
                assert!(evicted.is_empty());
            } else {
                assert_eq!(evicted.len(), 1);
                assert_eq!(evicted[0].id, ids[round - 2]);
            }
            ids.push(snap.id);
            assert!(store.list_snapshots().unwrap().len() <= depth as usize);
        }

        let retained = store.list_snapshots().unwrap();
        assert_eq!(retained[0].id, ids[3]);
        assert_eq!(retained[1].id, ids[2]);
        assert_eq!(store.gc_len(), 2);
        assert!(store.next_snapshot_slot(0).is_err());
    }

    #[test]
    fn test_export_and_replace_contents() {
        let store = store();
        let keep = committed_file(&store, "keep", 25);
        let export = store.export().unwrap();

        let later = committed_file(&store, "later", 10);
        store.move_to_trash(keep.id).unwrap();
        store
            .create_session(params("pending", Uuid::new_v4(), 10))
            .unwrap();

        let summary = store.replace_contents(&export).unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.sessions_dropped, 1);
        assert_eq!(summary.shards_released, 1);

        let restored = store.get_file(keep.id).unwrap().unwrap();
        assert_eq!(restored.state, FileState::Active);
        assert!(store.get_file(later.id).unwrap().is_none());
        assert!(store.list_sessions().unwrap().is_empty());
        assert_eq!(store.export().unwrap().manifest, export.manifest);
    }

    #[test]
    fn test_replace_contents_rejects_inconsistent_export() {
        let store = store();
        committed_file(&store, "f", 25);
        let mut export = store.export().unwrap();
        export.manifest.chunks.pop();
        let export = ManifestExport::new(export.manifest).unwrap();

        assert!(matches!(
            store.replace_contents(&export),
            Err(NekoError::Integrity(_))
        ));
        assert_eq!(store.list_files(None).unwrap().len(), 1);
    }

    #[test]
    fn test_manifest_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ManifestStore::open(dir.path()).unwrap();
            let file = committed_file(&store, "t", 25);
            store.flush().unwrap();
            file.id
        };

        let store = ManifestStore::open(dir.path()).unwrap();
        let file = store.get_file(id).unwrap().unwrap();
        assert_eq!(file.chunk_count, 3);
        assert_eq!(store.file_chunks(id).unwrap().len(), 3);
    }

    #[test]
    fn test_stats() {
        let store = store();
        let a = committed_file(&store, "a", 25);
        committed_file(&store, "b", 5);
        store.move_to_trash(a.id).unwrap();
        store
            .create_session(params("c", Uuid::new_v4(), 50))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.active_files, 1);
        assert_eq!(stats.active_bytes, 5);
        assert_eq!(stats.trashed_files, 1);
        assert_eq!(stats.trashed_bytes, 25);
        assert_eq!(stats.pending_uploads, 1);
    }
}
