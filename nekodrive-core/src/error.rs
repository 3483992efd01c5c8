//! Error types for NekoDrive
//!
//! Provides the unified error taxonomy used by the codec, the shard store
//! adapter, the manifest store and the upload session manager.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for NekoDrive operations
pub type Result<T> = std::result::Result<T, NekoError>;

/// Unified error type for NekoDrive
#[derive(Error, Debug)]
pub enum NekoError {
    // ===== Upload Protocol Errors =====
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid chunk index: {index} (chunk count: {count})")]
    InvalidSequence { index: u32, count: u32 },

    #[error("Upload incomplete: {} chunk(s) missing", missing.len())]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ===== Integrity Errors =====
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    // ===== Cryptography Errors =====
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // ===== Shard Store Errors =====
    #[error("Shard too large: {size} bytes (max: {max})")]
    ShardTooLarge { size: usize, max: usize },

    #[error("Shard store unavailable after {attempts} attempt(s): {last_error}")]
    ShardUnavailable { attempts: u32, last_error: String },

    #[error("Transient shard store failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NekoError {
    /// Build a transient failure without a server-provided backoff hint
    pub fn transient(message: impl Into<String>) -> Self {
        NekoError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether the shard store adapter may retry the failed operation.
    ///
    /// Digest and sequence violations are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, NekoError::Transient { .. })
    }

    /// Stable machine-readable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            NekoError::Conflict(_) => "ConflictError",
            NekoError::InvalidSequence { .. } => "InvalidSequenceError",
            NekoError::IncompleteUpload { .. } => "IncompleteUploadError",
            NekoError::SessionExpired(_) => "SessionExpiredError",
            NekoError::InvalidRequest(_) => "InvalidRequestError",
            NekoError::Integrity(_) => "IntegrityError",
            NekoError::ShardUnavailable { .. } | NekoError::Transient { .. } => {
                "ShardUnavailableError"
            }
            NekoError::NotFound(_) => "NotFoundError",
            _ => "InternalError",
        }
    }
}

impl From<bincode::Error> for NekoError {
    fn from(err: bincode::Error) -> Self {
        NekoError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for NekoError {
    fn from(err: serde_json::Error) -> Self {
        NekoError::Serialization(err.to_string())
    }
}
