//! Gateway configuration
//!
//! Loaded from TOML, then environment variables, then CLI flags.

use axum::http::HeaderValue;
use nekodrive_core::crypto::TAG_SIZE;
use nekodrive_core::{ChunkCodec, EncryptionKey, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_SHARD_SIZE};
use nekodrive_storage::{BreakerConfig, DiscordSettings, RetryPolicy, ShardStoreConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerSettings,

    /// Local manifest database and chunking
    #[serde(default)]
    pub storage: StorageSettings,

    /// Shard substrate (Discord webhooks or in-memory)
    #[serde(default)]
    pub substrate: SubstrateSettings,

    /// Resumable upload sessions
    #[serde(default)]
    pub uploads: UploadSettings,

    /// Background maintenance daemon
    #[serde(default)]
    pub maintenance: MaintenanceSettings,

    /// Master key material
    #[serde(default)]
    pub crypto: CryptoSettings,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;
        self.server.origin_headers()?;

        if self.storage.chunk_size + TAG_SIZE > self.substrate.max_shard_size {
            return Err(ConfigError::ValidationError(format!(
                "chunk size {} plus {}-byte tag exceeds the shard ceiling of {}",
                self.storage.chunk_size, TAG_SIZE, self.substrate.max_shard_size
            )));
        }
        self.codec()?;

        if self.substrate.kind == SubstrateKind::Discord && self.substrate.webhook_urls.is_empty() {
            return Err(ConfigError::ValidationError(
                "discord substrate requires at least one webhook URL".to_string(),
            ));
        }
        if self.substrate.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "substrate max_attempts cannot be 0".to_string(),
            ));
        }

        if self.uploads.session_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "upload session TTL cannot be 0".to_string(),
            ));
        }
        if self.uploads.max_parallel_chunks == 0 {
            return Err(ConfigError::ValidationError(
                "max_parallel_chunks cannot be 0".to_string(),
            ));
        }

        if self.maintenance.snapshot_depth == 0 {
            return Err(ConfigError::ValidationError(
                "snapshot rotation depth cannot be 0".to_string(),
            ));
        }

        if !self.crypto.has_key_material() && self.substrate.kind == SubstrateKind::Discord {
            return Err(ConfigError::ValidationError(
                "a master key (hex) or passphrase and salt is required".to_string(),
            ));
        }
        if self.crypto.passphrase.is_some() != self.crypto.salt.is_some() {
            return Err(ConfigError::ValidationError(
                "passphrase and salt must be given together".to_string(),
            ));
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        http_addr: Option<String>,
        data_dir: Option<PathBuf>,
        memory_substrate: bool,
    ) -> Self {
        if let Some(addr) = http_addr {
            self.server.http_addr = addr;
        }
        if let Some(dir) = data_dir {
            self.storage.data_dir = dir;
        }
        if memory_substrate {
            self.substrate.kind = SubstrateKind::Memory;
        }
        self
    }

    /// Apply environment variable overrides to all settings
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("NEKODRIVE_HTTP_ADDR") {
            self.server.http_addr = addr;
        }

        if let Ok(dir) = std::env::var("NEKODRIVE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(origins) = std::env::var("NEKODRIVE_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        // Comma-separated; presence switches the substrate to Discord
        if let Ok(urls) = std::env::var("DISCORD_WEBHOOK_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                self.substrate.webhook_urls = urls;
                self.substrate.kind = SubstrateKind::Discord;
            }
        }

        if let Some(ttl) = env_parse("NEKODRIVE_SESSION_TTL_SECS") {
            self.uploads.session_ttl_secs = ttl;
        }

        if let Some(days) = env_parse("NEKODRIVE_TRASH_RETENTION_DAYS") {
            self.maintenance.trash_retention_days = days;
        }

        if let Some(depth) = env_parse("NEKODRIVE_SNAPSHOT_DEPTH") {
            self.maintenance.snapshot_depth = depth;
        }

        if let Ok(key) = std::env::var("NEKODRIVE_MASTER_KEY") {
            self.crypto.master_key_hex = Some(key);
        }
        if let Ok(passphrase) = std::env::var("NEKODRIVE_PASSPHRASE") {
            self.crypto.passphrase = Some(passphrase);
        }
        if let Ok(salt) = std::env::var("NEKODRIVE_SALT") {
            self.crypto.salt = Some(salt);
        }

        self
    }

    /// Chunk codec matching the storage and substrate settings
    pub fn codec(&self) -> Result<ChunkCodec, ConfigError> {
        ChunkCodec::new(self.storage.chunk_size, self.substrate.max_shard_size)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Retry and breaker settings for the shard adapter
    pub fn shard_store_config(&self) -> ShardStoreConfig {
        ShardStoreConfig::default()
            .with_max_shard_size(self.substrate.max_shard_size)
            .with_retry(RetryPolicy {
                max_attempts: self.substrate.max_attempts,
                base_delay: Duration::from_millis(self.substrate.base_delay_ms),
                max_delay: Duration::from_millis(self.substrate.max_delay_ms),
            })
            .with_breaker(BreakerConfig {
                failure_threshold: self.substrate.breaker_failure_threshold,
                recovery_timeout: Duration::from_secs(self.substrate.breaker_recovery_secs),
            })
    }

    /// Path of the sled manifest database
    pub fn manifest_path(&self) -> PathBuf {
        self.storage.data_dir.join("manifest")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Enable CORS for all origins (development only)
    #[serde(default)]
    pub cors_permissive: bool,

    /// Browser origins allowed to call the API; empty means same-origin only
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            cors_permissive: false,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http_addr.parse().map_err(|e| {
            ConfigError::ValidationError(format!("invalid http_addr {}: {}", self.http_addr, e))
        })
    }

    /// Parsed `cors_origins`
    pub fn origin_headers(&self) -> Result<Vec<HeaderValue>, ConfigError> {
        self.cors_origins
            .iter()
            .map(|origin| {
                if origin == "*" {
                    return Err(ConfigError::ValidationError(
                        "use cors_permissive instead of a * origin".to_string(),
                    ));
                }
                HeaderValue::from_str(origin).map_err(|_| {
                    ConfigError::ValidationError(format!("invalid CORS origin {}", origin))
                })
            })
            .collect()
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8180".to_string()
}

/// Manifest database and chunking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding the sled manifest
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Plaintext chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./nekodrive_data")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// Which substrate holds shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    /// Discord webhook attachments
    Discord,
    /// Process memory; contents are lost on restart
    #[default]
    Memory,
}

/// Shard substrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateSettings {
    #[serde(default)]
    pub kind: SubstrateKind,

    /// Discord webhook URLs, used round-robin
    #[serde(default)]
    pub webhook_urls: Vec<String>,

    /// Attachment ceiling in bytes
    #[serde(default = "default_max_shard_size")]
    pub max_shard_size: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Attempts per shard operation, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive exhausted operations before the circuit opens
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_recovery")]
    pub breaker_recovery_secs: u64,
}

impl Default for SubstrateSettings {
    fn default() -> Self {
        Self {
            kind: SubstrateKind::default(),
            webhook_urls: Vec::new(),
            max_shard_size: default_max_shard_size(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_recovery_secs: default_breaker_recovery(),
        }
    }
}

impl SubstrateSettings {
    pub fn discord_settings(&self) -> DiscordSettings {
        DiscordSettings {
            webhook_urls: self.webhook_urls.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

fn default_max_shard_size() -> usize {
    DEFAULT_MAX_SHARD_SIZE
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_recovery() -> u64 {
    30
}

/// Resumable upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Idle lifetime of a session; every committed chunk extends it
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Shard uploads in flight per session
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,

    /// Shards fetched ahead of the reader when streaming content
    #[serde(default = "default_read_prefetch")]
    pub read_prefetch: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            max_parallel_chunks: default_max_parallel_chunks(),
            read_prefetch: default_read_prefetch(),
        }
    }
}

impl UploadSettings {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }
}

fn default_session_ttl() -> u64 {
    24 * 3600
}

fn default_max_parallel_chunks() -> usize {
    4
}

fn default_read_prefetch() -> usize {
    2
}

/// Background maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceSettings {
    /// Run the maintenance daemon
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between maintenance cycles
    #[serde(default = "default_maintenance_interval")]
    pub interval_secs: u64,

    /// Sessions that time out are kept this long past their deadline
    /// before the sweep reclaims them; aborted sessions are reclaimed at once
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,

    /// Trashed files older than this are purged (0 = never)
    #[serde(default = "default_trash_retention")]
    pub trash_retention_days: u64,

    /// Seconds between automatic snapshots (0 = disabled)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Number of snapshots kept in the rotation
    #[serde(default = "default_snapshot_depth")]
    pub snapshot_depth: u32,

    /// Shard deletions retried per cycle
    #[serde(default = "default_gc_batch")]
    pub gc_batch: usize,

    /// Deletion attempts before a shard is given up as orphaned
    #[serde(default = "default_gc_max_attempts")]
    pub gc_max_attempts: u32,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_maintenance_interval(),
            orphan_grace_secs: default_orphan_grace(),
            trash_retention_days: default_trash_retention(),
            snapshot_interval_secs: default_snapshot_interval(),
            snapshot_depth: default_snapshot_depth(),
            gc_batch: default_gc_batch(),
            gc_max_attempts: default_gc_max_attempts(),
        }
    }
}

impl MaintenanceSettings {
    pub fn orphan_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.orphan_grace_secs as i64)
    }

    pub fn trash_retention(&self) -> Option<chrono::Duration> {
        (self.trash_retention_days > 0).then(|| chrono::Duration::days(self.trash_retention_days as i64))
    }

    pub fn snapshot_interval(&self) -> Option<chrono::Duration> {
        (self.snapshot_interval_secs > 0)
            .then(|| chrono::Duration::seconds(self.snapshot_interval_secs as i64))
    }
}

fn default_true() -> bool {
    true
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_orphan_grace() -> u64 {
    3600
}

fn default_trash_retention() -> u64 {
    30
}

fn default_snapshot_interval() -> u64 {
    24 * 3600
}

fn default_snapshot_depth() -> u32 {
    7
}

fn default_gc_batch() -> usize {
    64
}

fn default_gc_max_attempts() -> u32 {
    10
}

/// Master key material
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CryptoSettings {
    /// 32-byte master key, hex encoded
    #[serde(default)]
    pub master_key_hex: Option<String>,

    /// Passphrase stretched with Argon2 into the master key
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Salt for the passphrase derivation; must stay fixed for the lifetime of the data
    #[serde(default)]
    pub salt: Option<String>,
}

impl std::fmt::Debug for CryptoSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSettings")
            .field("master_key_hex", &self.master_key_hex.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("salt", &self.salt)
            .finish()
    }
}

impl CryptoSettings {
    pub fn has_key_material(&self) -> bool {
        self.master_key_hex.is_some() || (self.passphrase.is_some() && self.salt.is_some())
    }

    /// Resolve the master key.
    ///
    /// Returns `Ok(None)` when no material is configured.
    pub fn master_key(&self) -> Result<Option<EncryptionKey>, ConfigError> {
        if let Some(hex_key) = &self.master_key_hex {
            return EncryptionKey::from_hex(hex_key.trim())
                .map(Some)
                .map_err(|e| ConfigError::ValidationError(format!("master key: {}", e)));
        }
        match (&self.passphrase, &self.salt) {
            (Some(passphrase), Some(salt)) => {
                EncryptionKey::derive_from_password(passphrase.as_bytes(), salt.as_bytes())
                    .map(Some)
                    .map_err(|e| ConfigError::ValidationError(format!("passphrase: {}", e)))
            }
            _ => Ok(None),
        }
    }
}
