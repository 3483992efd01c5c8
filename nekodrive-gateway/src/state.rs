//! Application State
//!
//! Shared state for all gateway components: the manifest, the resilient
//! shard store and the services built over them.

use crate::config::{GatewayConfig, SubstrateKind};
use crate::lifecycle::{LifecycleService, SweepReport};
use crate::reader::FileReader;
use crate::sessions::SessionManager;
use chrono::Utc;
use nekodrive_core::{ChunkCodec, EncryptionKey, NekoError, Result};
use nekodrive_metadata::{ManifestStore, RestoreSummary};
use nekodrive_storage::{
    CircuitBreaker, DiscordShardStore, MemoryShardStore, ResilientShardStore, ShardStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Shard store as seen by the engine: any substrate behind retries and a breaker
pub type SharedShardStore = Arc<ResilientShardStore<Arc<dyn ShardStore>>>;

/// Shared application state
pub struct AppState {
    config: GatewayConfig,
    manifest: Arc<ManifestStore>,
    shards: SharedShardStore,
    codec: ChunkCodec,
    sessions: SessionManager,
    lifecycle: LifecycleService,
    reader: FileReader,
    started_at: Instant,
}

impl AppState {
    /// Open the manifest and connect the configured substrate
    pub fn with_config(config: GatewayConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NekoError::Configuration(e.to_string()))?;

        let manifest = ManifestStore::open(config.manifest_path())?;

        let substrate: Arc<dyn ShardStore> = match config.substrate.kind {
            SubstrateKind::Discord => {
                info!(
                    webhooks = config.substrate.webhook_urls.len(),
                    "Using Discord webhook substrate"
                );
                Arc::new(DiscordShardStore::new(&config.substrate.discord_settings())?)
            }
            SubstrateKind::Memory => {
                warn!("Using in-memory substrate, shard contents are lost on restart");
                Arc::new(MemoryShardStore::with_max_shard_size(
                    config.substrate.max_shard_size,
                ))
            }
        };

        let master_key = match config
            .crypto
            .master_key()
            .map_err(|e| NekoError::Configuration(e.to_string()))?
        {
            Some(key) => key,
            None if config.substrate.kind == SubstrateKind::Memory => {
                warn!("No master key configured, using an ephemeral key");
                EncryptionKey::generate()
            }
            None => {
                return Err(NekoError::Configuration(
                    "no master key material configured".to_string(),
                ))
            }
        };

        Self::with_parts(config, manifest, substrate, master_key)
    }

    /// Assemble state from an already opened manifest and substrate
    pub fn with_parts(
        config: GatewayConfig,
        manifest: ManifestStore,
        substrate: Arc<dyn ShardStore>,
        master_key: EncryptionKey,
    ) -> Result<Self> {
        let codec = config
            .codec()
            .map_err(|e| NekoError::Configuration(e.to_string()))?;
        let manifest = Arc::new(manifest);
        let shards: SharedShardStore = Arc::new(config.shard_store_config().wrap(substrate));

        let sessions = SessionManager::new(
            manifest.clone(),
            shards.clone(),
            codec,
            master_key.clone(),
            config.uploads.session_ttl(),
            config.uploads.max_parallel_chunks,
        );
        let lifecycle = LifecycleService::new(
            manifest.clone(),
            shards.clone(),
            codec,
            master_key.clone(),
            config.maintenance.clone(),
            config.uploads.read_prefetch,
        );
        let reader = FileReader::new(
            manifest.clone(),
            shards.clone(),
            codec,
            master_key,
            config.uploads.read_prefetch,
        );

        info!(
            chunk_size = codec.chunk_size(),
            max_shard_size = codec.max_shard_size(),
            substrate = shards.name(),
            "Engine ready"
        );

        Ok(Self {
            config,
            manifest,
            shards,
            codec,
            sessions,
            lifecycle,
            reader,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn shards(&self) -> &SharedShardStore {
        &self.shards
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.shards.breaker()
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn lifecycle(&self) -> &LifecycleService {
        &self.lifecycle
    }

    pub fn reader(&self) -> &FileReader {
        &self.reader
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Orphan sweep, also dropping the sessions' concurrency slots
    pub async fn sweep_orphans(&self, force: bool) -> Result<SweepReport> {
        let report = self.lifecycle.sweep_orphans(Utc::now(), force).await?;
        for token in &report.removed_tokens {
            self.sessions.forget(token);
        }
        Ok(report)
    }

    /// Snapshot restore; every pending session is dropped with the old state
    pub async fn restore_snapshot(&self, id: Uuid) -> Result<RestoreSummary> {
        let summary = self.lifecycle.restore_snapshot(id).await?;
        self.sessions.forget_all();
        Ok(summary)
    }
}
