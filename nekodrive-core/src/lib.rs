//! NekoDrive Core Library
//!
//! Core abstractions for the NekoDrive storage engine.
//! This crate provides:
//! - The chunk codec (fixed-size chunking, per-chunk AES-256-GCM, integrity digests)
//! - Cryptographic primitives (Blake3 hashing, key and nonce derivation)
//! - Chunk records and opaque shard locators
//! - The error taxonomy shared by every layer of the engine

pub mod chunk;
pub mod codec;
pub mod crypto;
pub mod error;

pub use chunk::{ChunkRecord, DataKind, ShardLocator};
pub use codec::{ChunkCodec, ChunkDecoder, EncodedChunk, EncodedFile, FileDigest};
pub use crypto::{ContentHash, EncryptionKey};
pub use error::{NekoError, Result};

/// Chunk size constants
pub const MIN_CHUNK_SIZE: usize = 64 * 1024; // 64 KB
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024; // 8 MB

/// Attachment ceiling of the shard substrate.
///
/// Discord webhooks accept 10 MiB per attachment without a boosted server;
/// every ciphertext shard must fit under it.
pub const DEFAULT_MAX_SHARD_SIZE: usize = 10 * 1024 * 1024; // 10 MB
