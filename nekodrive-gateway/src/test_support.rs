//! Fixtures for unit tests

use crate::config::GatewayConfig;
use crate::sessions::StartUpload;
use crate::state::AppState;
use bytes::Bytes;
use nekodrive_core::{ContentHash, EncryptionKey, MIN_CHUNK_SIZE};
use nekodrive_metadata::{FileRecord, ManifestStore};
use nekodrive_storage::{MemoryShardStore, ShardStore};
use std::sync::Arc;

pub fn chunk_size() -> usize {
    MIN_CHUNK_SIZE
}

/// Small chunks and near-instant retries
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.storage.chunk_size = chunk_size();
    config.substrate.max_attempts = 3;
    config.substrate.base_delay_ms = 1;
    config.substrate.max_delay_ms = 5;
    config.maintenance.snapshot_depth = 2;
    config
}

/// State over a temporary manifest and an in-memory substrate
pub fn test_state() -> (AppState, Arc<MemoryShardStore>) {
    let memory = Arc::new(MemoryShardStore::new());
    let substrate: Arc<dyn ShardStore> = memory.clone();
    let state = AppState::with_parts(
        test_config(),
        ManifestStore::open_temporary().unwrap(),
        substrate,
        EncryptionKey::generate(),
    )
    .unwrap();
    (state, memory)
}

/// Upload `data` through a full session
pub async fn write_file(state: &AppState, name: &str, data: &[u8]) -> FileRecord {
    let ticket = state
        .sessions()
        .start(StartUpload {
            name: name.to_string(),
            size: data.len() as u64,
            file_id: None,
        })
        .await
        .unwrap();

    for (index, chunk) in data.chunks(ticket.chunk_size as usize).enumerate() {
        let body = Bytes::copy_from_slice(chunk);
        let digest = ContentHash::compute(&body);
        state
            .sessions()
            .put_chunk(&ticket.token, index as u32, body, digest)
            .await
            .unwrap();
    }

    state.sessions().complete(&ticket.token).await.unwrap()
}
