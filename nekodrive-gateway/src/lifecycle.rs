//! Lifecycle and maintenance operations
//!
//! - Trash, restore and purge of committed files
//! - Orphan sweep of expired or abandoned upload sessions
//! - Retry of queued shard deletions
//! - Circular manifest snapshots and restore
//!
//! Manifest changes are authoritative and happen first. Shard deletions that
//! follow are best effort: every locator being released sits in the
//! manifest's deletion queue until the substrate confirms it is gone.

use crate::config::MaintenanceSettings;
use crate::reader::fetch_shards;
use crate::state::SharedShardStore;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use metrics::{counter, gauge};
use nekodrive_core::{ChunkCodec, ChunkRecord, DataKind, EncryptionKey, NekoError, Result, ShardLocator};
use nekodrive_metadata::{
    FileRecord, ManifestExport, ManifestStore, RestoreSummary, SessionState, SnapshotRecord,
    SnapshotSummary,
};
use nekodrive_storage::ShardStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shard deletions in flight at once
const DELETE_PARALLELISM: usize = 8;

/// Outcome of releasing a set of shards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    /// Confirmed gone from the substrate
    pub deleted: usize,
    /// Still queued for a later attempt
    pub pending: usize,
}

/// Delete queued shards, resolving or re-recording each queue entry.
///
/// Locators must already be in the deletion queue.
pub(crate) async fn release_shards(
    manifest: &ManifestStore,
    shards: &SharedShardStore,
    locators: Vec<ShardLocator>,
) -> Result<ReleaseReport> {
    let outcomes: Vec<(ShardLocator, Result<()>)> = stream::iter(locators)
        .map(|locator| async move {
            let outcome = shards.delete(&locator).await;
            (locator, outcome)
        })
        .buffer_unordered(DELETE_PARALLELISM)
        .collect()
        .await;

    let mut report = ReleaseReport::default();
    for (locator, outcome) in outcomes {
        match outcome {
            Ok(()) | Err(NekoError::NotFound(_)) => {
                manifest.gc_resolve(&locator)?;
                report.deleted += 1;
            }
            Err(e) => {
                warn!(locator = %locator, error = %e, "Shard deletion failed, left queued");
                manifest.gc_record_failure(&locator, &e.to_string())?;
                report.pending += 1;
            }
        }
    }

    counter!("shards_deleted_total").increment(report.deleted as u64);
    Ok(report)
}

/// Queue and release shards that were written but never recorded
pub(crate) async fn discard_shards(
    manifest: &ManifestStore,
    shards: &SharedShardStore,
    locators: Vec<ShardLocator>,
) -> Result<ReleaseReport> {
    if locators.is_empty() {
        return Ok(ReleaseReport::default());
    }
    manifest.enqueue_gc(&locators)?;
    release_shards(manifest, shards, locators).await
}

/// Result of purging one file
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub file_id: Uuid,
    pub shards_released: usize,
    pub shards_deleted: usize,
    pub shards_pending: usize,
}

/// Result of an orphan sweep
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub sessions_removed: usize,
    pub shards_deleted: usize,
    pub shards_pending: usize,
    /// Sessions that could not be removed this time
    pub sessions_failed: usize,

    /// Tokens of the removed sessions; never rendered
    #[serde(skip)]
    pub removed_tokens: Vec<String>,
}

/// Result of one pass over the deletion queue
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub attempted: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Entries dropped after too many attempts; their shards are orphaned
    pub abandoned: usize,
    pub backlog: usize,
}

/// Trash, purge, sweep and snapshot operations over the manifest and substrate
pub struct LifecycleService {
    manifest: Arc<ManifestStore>,
    shards: SharedShardStore,
    codec: ChunkCodec,
    master_key: EncryptionKey,
    settings: MaintenanceSettings,
    prefetch: usize,
    snapshot_lock: tokio::sync::Mutex<()>,
}

impl LifecycleService {
    pub fn new(
        manifest: Arc<ManifestStore>,
        shards: SharedShardStore,
        codec: ChunkCodec,
        master_key: EncryptionKey,
        settings: MaintenanceSettings,
        prefetch: usize,
    ) -> Self {
        Self {
            manifest,
            shards,
            codec,
            master_key,
            settings,
            prefetch: prefetch.max(1),
            snapshot_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &MaintenanceSettings {
        &self.settings
    }

    // ===== Trash =====

    pub fn trash(&self, id: Uuid) -> Result<FileRecord> {
        let file = self.manifest.move_to_trash(id)?;
        info!(file_id = %id, name = %file.name, "File moved to trash");
        Ok(file)
    }

    pub fn restore(&self, id: Uuid) -> Result<FileRecord> {
        let file = self.manifest.restore(id)?;
        info!(file_id = %id, name = %file.name, "File restored from trash");
        Ok(file)
    }

    /// Remove a trashed file for good.
    ///
    /// The metadata removal commits before any shard is touched, so the
    /// purge succeeds even when the substrate is down.
    pub async fn purge(&self, id: Uuid) -> Result<PurgeReport> {
        let locators = self.manifest.purge(id)?;
        let released = locators.len();
        let report = release_shards(&self.manifest, &self.shards, locators).await?;

        counter!("files_purged_total").increment(1);
        info!(
            file_id = %id,
            shards = released,
            pending = report.pending,
            "File purged"
        );
        Ok(PurgeReport {
            file_id: id,
            shards_released: released,
            shards_deleted: report.deleted,
            shards_pending: report.pending,
        })
    }

    /// Purge trashed files past the retention period
    pub async fn purge_expired_trash(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = match self.settings.trash_retention() {
            Some(r) => r,
            None => return Ok(0),
        };

        let mut purged = 0;
        for file in self.manifest.trashed_before(now - retention)? {
            match self.purge(file.id).await {
                Ok(_) => purged += 1,
                // Restored or purged concurrently
                Err(NekoError::NotFound(_)) | Err(NekoError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(purged)
    }

    // ===== Orphans =====

    /// Reclaim upload sessions that can no longer complete.
    ///
    /// Aborted sessions are reclaimed at once. A session that ran past its
    /// deadline is reclaimed once it is `orphan_grace` past it. `force`
    /// reclaims every pending session. A session that fails to reclaim is
    /// logged and counted; the sweep moves on to the next one.
    pub async fn sweep_orphans(&self, now: DateTime<Utc>, force: bool) -> Result<SweepReport> {
        let grace = self.settings.orphan_grace();
        let mut report = SweepReport::default();

        for session in self.manifest.list_sessions()? {
            let reclaim = force
                || session.state == SessionState::Expired
                || now >= session.expires_at + grace;
            if !reclaim {
                continue;
            }

            let locators = match self.manifest.remove_session(&session.token) {
                Ok(l) => l,
                Err(NekoError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(file_id = %session.file_id, error = %e, "Failed to remove upload session");
                    report.sessions_failed += 1;
                    continue;
                }
            };
            debug!(
                file_id = %session.file_id,
                state = %session.state,
                shards = locators.len(),
                "Reclaiming upload session"
            );
            report.sessions_removed += 1;
            report.removed_tokens.push(session.token);

            // Shards are queued with the removal; failures stay queued
            let shard_count = locators.len();
            match release_shards(&self.manifest, &self.shards, locators).await {
                Ok(released) => {
                    report.shards_deleted += released.deleted;
                    report.shards_pending += released.pending;
                }
                Err(e) => {
                    warn!(file_id = %session.file_id, error = %e, "Failed to release session shards");
                    report.shards_pending += shard_count;
                }
            }
        }

        if report.sessions_removed > 0 {
            counter!("sessions_reclaimed_total").increment(report.sessions_removed as u64);
            info!(
                sessions = report.sessions_removed,
                shards = report.shards_deleted,
                failed = report.sessions_failed,
                force,
                "Orphan sweep reclaimed sessions"
            );
        }
        Ok(report)
    }

    // ===== Shard GC =====

    /// One pass over the deletion queue
    pub async fn retry_gc(&self) -> Result<GcReport> {
        let entries = self.manifest.gc_pending(self.settings.gc_batch)?;
        let mut report = GcReport::default();
        let mut retry = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.attempts >= self.settings.gc_max_attempts {
                error!(
                    locator = %entry.locator,
                    attempts = entry.attempts,
                    last_error = entry.last_error.as_deref().unwrap_or(""),
                    "Giving up on shard deletion, shard is orphaned"
                );
                self.manifest.gc_resolve(&entry.locator)?;
                report.abandoned += 1;
            } else {
                retry.push(entry.locator);
            }
        }

        report.attempted = retry.len();
        let released = release_shards(&self.manifest, &self.shards, retry).await?;
        report.deleted = released.deleted;
        report.failed = released.pending;
        report.backlog = self.manifest.gc_len();

        gauge!("shard_gc_backlog").set(report.backlog as f64);
        Ok(report)
    }

    // ===== Snapshots =====

    /// Whether the periodic snapshot is due
    pub fn snapshot_due(&self, now: DateTime<Utc>) -> Result<bool> {
        let interval = match self.settings.snapshot_interval() {
            Some(i) => i,
            None => return Ok(false),
        };
        Ok(match self.manifest.list_snapshots()?.first() {
            Some(latest) => now - latest.created_at >= interval,
            None => true,
        })
    }

    /// Export the manifest, store it as system shards and record it in the
    /// next rotation slot, evicting the oldest snapshot when full.
    pub async fn snapshot(&self) -> Result<SnapshotSummary> {
        let _guard = self.snapshot_lock.lock().await;
        let depth = self.settings.snapshot_depth;

        let export = self.manifest.export()?;
        let bytes = export.to_json_bytes()?;
        let snapshot_id = Uuid::new_v4();
        let key = self.master_key.derive_file_key(snapshot_id);
        let encoded = self.codec.encode(&key, snapshot_id, &bytes)?;

        let mut chunks: Vec<ChunkRecord> = Vec::with_capacity(encoded.chunks.len());
        for chunk in &encoded.chunks {
            match self.shards.put(chunk.ciphertext.clone()).await {
                Ok(locator) => {
                    chunks.push(chunk.to_record(snapshot_id, locator, DataKind::System))
                }
                Err(e) => {
                    self.discard(&chunks).await;
                    return Err(e);
                }
            }
        }

        let record = SnapshotRecord {
            id: snapshot_id,
            created_at: Utc::now(),
            slot: self.manifest.next_snapshot_slot(depth)?,
            file_count: export.manifest.files.len() as u64,
            size: bytes.len() as u64,
            digest: encoded.digest,
            chunks,
        };

        let evicted = match self.manifest.record_snapshot(&record, depth) {
            Ok(evicted) => evicted,
            Err(e) => {
                self.discard(&record.chunks).await;
                return Err(e);
            }
        };

        let evicted_locators: Vec<ShardLocator> = evicted
            .iter()
            .flat_map(|s| s.chunks.iter().map(|c| c.locator.clone()))
            .collect();
        release_shards(&self.manifest, &self.shards, evicted_locators).await?;

        counter!("snapshots_created_total").increment(1);
        info!(
            snapshot_id = %snapshot_id,
            slot = record.slot,
            files = record.file_count,
            bytes = record.size,
            "Snapshot created"
        );
        Ok(SnapshotSummary::from(&record))
    }

    /// Fetch, decode and verify a snapshot, then replace the live manifest
    /// with its contents in one transaction.
    pub async fn restore_snapshot(&self, id: Uuid) -> Result<RestoreSummary> {
        let _guard = self.snapshot_lock.lock().await;

        let record = self
            .manifest
            .get_snapshot(id)?
            .ok_or_else(|| NekoError::NotFound(format!("snapshot {}", id)))?;

        let ciphertexts = fetch_shards(&self.shards, &record.chunks, self.prefetch).await?;

        let key = self.master_key.derive_file_key(record.id);
        let bytes =
            self.codec
                .decode_all(key, record.id, record.digest, record.chunks.clone(), &ciphertexts)?;
        let export = ManifestExport::from_json_bytes(&bytes)?;

        let summary = self.manifest.replace_contents(&export)?;
        info!(
            snapshot_id = %id,
            files = summary.files,
            sessions_dropped = summary.sessions_dropped,
            "Snapshot restored"
        );
        Ok(summary)
    }

    async fn discard(&self, chunks: &[ChunkRecord]) {
        let locators = chunks.iter().map(|c| c.locator.clone()).collect();
        if let Err(e) = discard_shards(&self.manifest, &self.shards, locators).await {
            warn!(error = %e, "Failed to queue unrecorded snapshot shards");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use crate::test_support::{test_state, write_file};
    use bytes::Bytes;
    use nekodrive_core::ContentHash;
    use nekodrive_metadata::{CreateSession, EntryState, UploadSession};

    #[tokio::test]
    async fn test_purge_requires_trash() {
        let (state, _memory) = test_state();
        let file = write_file(&state, "a.bin", &[7u8; 1000]).await;

        let err = state.lifecycle().purge(file.id).await.unwrap_err();
        assert!(matches!(err, NekoError::Conflict(_)));

        state.lifecycle().trash(file.id).unwrap();
        let report = state.lifecycle().purge(file.id).await.unwrap();
        assert_eq!(report.shards_released, 1);
        assert_eq!(report.shards_deleted, 1);
        assert!(state.manifest().get_file(file.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_survives_substrate_outage() {
        let (state, memory) = test_state();
        let file = write_file(&state, "b.bin", &[1u8; 1000]).await;
        state.lifecycle().trash(file.id).unwrap();

        memory.set_outage(true);
        let report = state.lifecycle().purge(file.id).await.unwrap();
        assert_eq!(report.shards_pending, 1);
        assert!(state.manifest().get_file(file.id).unwrap().is_none());
        assert_eq!(state.manifest().gc_len(), 1);
        assert_eq!(memory.len(), 1);

        memory.set_outage(false);
        let gc = state.lifecycle().retry_gc().await.unwrap();
        assert_eq!(gc.deleted, 1);
        assert_eq!(gc.backlog, 0);
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_gc_gives_up_after_max_attempts() {
        let (state, memory) = test_state();
        let locator = memory.put(Bytes::from_static(b"orphan")).await.unwrap();
        state.manifest().enqueue_gc(&[locator.clone()]).unwrap();

        let max = state.lifecycle().settings().gc_max_attempts;
        for _ in 0..max {
            state.manifest().gc_record_failure(&locator, "down").unwrap();
        }

        let gc = state.lifecycle().retry_gc().await.unwrap();
        assert_eq!(gc.abandoned, 1);
        assert_eq!(gc.attempted, 0);
        assert_eq!(state.manifest().gc_len(), 0);
    }

    fn pending_session(state: &AppState, token: &str) -> UploadSession {
        state
            .manifest()
            .create_session(CreateSession {
                token: token.into(),
                file_id: Uuid::new_v4(),
                name: format!("{}.bin", token),
                declared_size: 10,
                chunk_size: 64 * 1024,
                chunk_count: 1,
                ttl: chrono::Duration::hours(2),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_waits_out_grace_after_timeout() {
        let (state, _memory) = test_state();
        let session = pending_session(&state, "idle");
        let grace = state.lifecycle().settings().orphan_grace();

        // Idle past the grace period but still inside its deadline
        let idle = session.created_at + grace + chrono::Duration::seconds(1);
        assert!(idle < session.expires_at);
        let report = state.lifecycle().sweep_orphans(idle, false).await.unwrap();
        assert_eq!(report.sessions_removed, 0);

        // Timed out, inside the grace period
        let timed_out = session.expires_at + chrono::Duration::seconds(1);
        let report = state.lifecycle().sweep_orphans(timed_out, false).await.unwrap();
        assert_eq!(report.sessions_removed, 0);
        assert!(state.manifest().get_session("idle").unwrap().is_some());

        let past_grace = session.expires_at + grace;
        let report = state.lifecycle().sweep_orphans(past_grace, false).await.unwrap();
        assert_eq!(report.sessions_removed, 1);
        assert_eq!(report.removed_tokens, vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_partial_upload_past_grace() {
        let (state, memory) = test_state();
        let ticket = state
            .sessions()
            .start(crate::sessions::StartUpload {
                name: "partial.bin".into(),
                size: (crate::test_support::chunk_size() * 2) as u64,
                file_id: None,
            })
            .await
            .unwrap();
        let body = Bytes::from(vec![5u8; crate::test_support::chunk_size()]);
        state
            .sessions()
            .put_chunk(&ticket.token, 0, body.clone(), ContentHash::compute(&body))
            .await
            .unwrap();
        assert_eq!(memory.len(), 1);

        let session = state.manifest().get_session(&ticket.token).unwrap().unwrap();
        let grace = state.lifecycle().settings().orphan_grace();
        let report = state
            .lifecycle()
            .sweep_orphans(session.expires_at + grace, false)
            .await
            .unwrap();
        assert_eq!(report.sessions_removed, 1);
        assert_eq!(report.shards_deleted, 1);
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_aborted_and_forced() {
        let (state, _memory) = test_state();
        pending_session(&state, "aborted");
        pending_session(&state, "live");
        state.sessions().abort("aborted").unwrap();

        let report = state.lifecycle().sweep_orphans(Utc::now(), false).await.unwrap();
        assert_eq!(report.removed_tokens, vec!["aborted".to_string()]);

        let report = state.lifecycle().sweep_orphans(Utc::now(), true).await.unwrap();
        assert_eq!(report.removed_tokens, vec!["live".to_string()]);
        assert_eq!(report.sessions_failed, 0);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failed_deletes() {
        let (state, memory) = test_state();
        let mut tokens = Vec::new();
        for name in ["first.bin", "second.bin"] {
            let ticket = state
                .sessions()
                .start(crate::sessions::StartUpload {
                    name: name.into(),
                    size: 10,
                    file_id: None,
                })
                .await
                .unwrap();
            let body = Bytes::from_static(b"0123456789");
            state
                .sessions()
                .put_chunk(&ticket.token, 0, body.clone(), ContentHash::compute(&body))
                .await
                .unwrap();
            state.sessions().abort(&ticket.token).unwrap();
            tokens.push(ticket.token);
        }

        memory.set_outage(true);
        let mut report = state.lifecycle().sweep_orphans(Utc::now(), false).await.unwrap();
        report.removed_tokens.sort();
        tokens.sort();
        assert_eq!(report.removed_tokens, tokens);
        assert_eq!(report.sessions_removed, 2);
        assert_eq!(report.shards_deleted, 0);
        assert_eq!(report.shards_pending, 2);
        assert!(state.manifest().list_sessions().unwrap().is_empty());

        memory.set_outage(false);
        let gc = state.lifecycle().retry_gc().await.unwrap();
        assert_eq!(gc.deleted, 2);
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_expired_trash_purged() {
        let (state, _memory) = test_state();
        let file = write_file(&state, "old.bin", b"old").await;
        state.lifecycle().trash(file.id).unwrap();

        let purged = state.lifecycle().purge_expired_trash(Utc::now()).await.unwrap();
        assert_eq!(purged, 0);

        let later = Utc::now() + chrono::Duration::days(31);
        let purged = state.lifecycle().purge_expired_trash(later).await.unwrap();
        assert_eq!(purged, 1);
        assert!(state
            .manifest()
            .list_files(Some(EntryState::Trashed))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_due() {
        let (state, _memory) = test_state();
        assert!(state.lifecycle().snapshot_due(Utc::now()).unwrap());

        state.lifecycle().snapshot().await.unwrap();
        assert!(!state.lifecycle().snapshot_due(Utc::now()).unwrap());
        assert!(state
            .lifecycle()
            .snapshot_due(Utc::now() + chrono::Duration::days(2))
            .unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_put_failure_leaves_no_record() {
        let (state, memory) = test_state();
        write_file(&state, "c.bin", b"content").await;

        memory.set_outage(true);
        assert!(state.lifecycle().snapshot().await.is_err());
        memory.set_outage(false);

        assert!(state.manifest().list_snapshots().unwrap().is_empty());
    }
}
