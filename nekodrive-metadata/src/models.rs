//! Manifest models
//!
//! These structs are stored bincode-encoded in the manifest trees and
//! rendered as camelCase JSON by the API.

use chrono::{DateTime, Duration, Utc};
use nekodrive_core::{ChunkRecord, ContentHash, ShardLocator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Lifecycle state of a committed file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Active,
    Trashed,
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trashed => write!(f, "trashed"),
        }
    }
}

/// State shown in listings; pending entries come from upload sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Active,
    Trashed,
    Pending,
}

impl From<FileState> for EntryState {
    fn from(state: FileState) -> Self {
        match state {
            FileState::Active => Self::Active,
            FileState::Trashed => Self::Trashed,
        }
    }
}

impl std::str::FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trashed" | "trash" => Ok(Self::Trashed),
            "pending" => Ok(Self::Pending),
            other => Err(format!("unknown file state: {}", other)),
        }
    }
}

/// Committed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,
    pub name: String,
    pub size: u64,

    /// Rolling digest over the ordered chunk digests
    pub digest: ContentHash,

    pub state: FileState,
    pub chunk_count: u32,
    pub chunk_size: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub trashed_at: Option<DateTime<Utc>>,
}

/// Upload session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    AcceptingChunks,
    Completing,
    Expired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::AcceptingChunks => write!(f, "accepting-chunks"),
            Self::Completing => write!(f, "completing"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Resumable upload in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Capability token; whoever holds it may write chunks
    pub token: String,
    pub file_id: Uuid,
    pub name: String,
    pub declared_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub committed: BTreeSet<u32>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Expired either explicitly or by running past its deadline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Expired || now >= self.expires_at
    }

    /// Indices not yet committed, ascending
    pub fn missing(&self) -> Vec<u32> {
        (0..self.chunk_count)
            .filter(|i| !self.committed.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.committed.len() == self.chunk_count as usize
            && self.committed.iter().enumerate().all(|(i, c)| i as u32 == *c)
    }

    /// Bytes accounted for by committed chunks
    pub fn committed_bytes(&self) -> u64 {
        let chunk = self.chunk_size as u64;
        self.committed
            .iter()
            .map(|&i| {
                let start = i as u64 * chunk;
                self.declared_size.saturating_sub(start).min(chunk)
            })
            .sum()
    }
}

/// Parameters for opening a new upload session
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub token: String,
    pub file_id: Uuid,
    pub name: String,
    pub declared_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub ttl: Duration,
}

impl CreateSession {
    pub fn into_session(self, now: DateTime<Utc>) -> UploadSession {
        UploadSession {
            token: self.token,
            file_id: self.file_id,
            name: self.name,
            declared_size: self.declared_size,
            chunk_size: self.chunk_size,
            chunk_count: self.chunk_count,
            committed: BTreeSet::new(),
            state: SessionState::Created,
            created_at: now,
            updated_at: now,
            expires_at: now + self.ttl,
        }
    }
}

/// Outcome of recording a chunk against a session
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The chunk was recorded
    Committed(UploadSession),
    /// The same chunk (same digest) was already recorded; nothing changed
    AlreadyCommitted(UploadSession),
}

/// One row of a file listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub state: EntryState,
    pub chunk_count: u32,
    pub committed_chunks: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub trashed_at: Option<DateTime<Utc>>,
}

impl From<&FileRecord> for FileSummary {
    fn from(file: &FileRecord) -> Self {
        Self {
            id: file.id,
            name: file.name.clone(),
            size: file.size,
            state: file.state.into(),
            chunk_count: file.chunk_count,
            committed_chunks: file.chunk_count,
            created_at: file.created_at,
            modified_at: file.modified_at,
            trashed_at: file.trashed_at,
        }
    }
}

impl From<&UploadSession> for FileSummary {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.file_id,
            name: session.name.clone(),
            size: session.declared_size,
            state: EntryState::Pending,
            chunk_count: session.chunk_count,
            committed_chunks: session.committed.len() as u32,
            created_at: session.created_at,
            modified_at: session.updated_at,
            trashed_at: None,
        }
    }
}

/// Shard waiting to be deleted from the substrate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcEntry {
    pub locator: ShardLocator,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl GcEntry {
    pub fn new(locator: ShardLocator) -> Self {
        Self {
            locator,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// One retained manifest snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,

    /// Rotation slot, `0..depth`
    pub slot: u32,

    /// Files captured in the export
    pub file_count: u64,

    /// Size of the serialized export in bytes
    pub size: u64,

    /// Rolling digest over the export's chunks
    pub digest: ContentHash,

    /// Shards holding the encrypted export, tagged as system data
    pub chunks: Vec<ChunkRecord>,
}

/// Snapshot metadata without the chunk list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub slot: u32,
    pub file_count: u64,
    pub size: u64,
    pub chunk_count: u32,
}

impl From<&SnapshotRecord> for SnapshotSummary {
    fn from(s: &SnapshotRecord) -> Self {
        Self {
            id: s.id,
            created_at: s.created_at,
            slot: s.slot,
            file_count: s.file_count,
            size: s.size,
            chunk_count: s.chunks.len() as u32,
        }
    }
}

/// Aggregate counters over the manifest
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub active_files: u64,
    pub active_bytes: u64,
    pub trashed_files: u64,
    pub trashed_bytes: u64,
    pub pending_uploads: u64,
    pub pending_bytes: u64,
    pub snapshots: u64,
    pub gc_backlog: u64,
    pub db_size: u64,
}

/// What a restore changed
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub files: u64,
    pub chunks: u64,
    pub sessions_dropped: u64,
    pub shards_released: u64,
}
