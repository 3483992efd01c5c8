//! Chunk records and shard locators
//!
//! A chunk is one fixed-size slice of a file's plaintext. Once encrypted and
//! placed on the substrate it becomes a shard, addressed by an opaque
//! [`ShardLocator`]. The [`ChunkRecord`] ties the two together and is what the
//! manifest stores.

use crate::crypto::{ContentHash, NONCE_SIZE, TAG_SIZE};
use crate::error::{NekoError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque handle returned by the shard store for one stored blob
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardLocator(String);

impl ShardLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ShardLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardLocator({})", self.0)
    }
}

impl fmt::Display for ShardLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a chunk carries user content or engine-internal data (snapshots)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    User,
    System,
}

/// One encrypted shard belonging to a file or snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// Parent file (or snapshot) id
    pub file_id: Uuid,

    /// Position within the parent, defines reassembly order
    pub index: u32,

    /// Plaintext length in bytes
    pub plaintext_len: u32,

    /// Ciphertext length in bytes, tag included
    pub ciphertext_len: u32,

    /// Nonce used to seal this chunk
    #[serde(with = "hex_array")]
    pub nonce: [u8; NONCE_SIZE],

    /// Authentication tag (also the trailing bytes of the shard)
    #[serde(with = "hex_array")]
    pub tag: [u8; TAG_SIZE],

    /// Blake3 digest of the plaintext
    pub digest: ContentHash,

    /// Where the shard lives on the substrate
    pub locator: ShardLocator,

    /// User data or system data
    pub kind: DataKind,

    /// When the shard was durably recorded
    pub committed_at: DateTime<Utc>,
}

impl ChunkRecord {
    /// Manifest key for this chunk: file id followed by big-endian index,
    /// so a prefix scan over the file id yields chunks in order.
    pub fn key(&self) -> [u8; 20] {
        chunk_key(self.file_id, self.index)
    }
}

/// Build the manifest key for chunk `index` of `file_id`
pub fn chunk_key(file_id: Uuid, index: u32) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..16].copy_from_slice(file_id.as_bytes());
    key[16..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Number of chunks needed for `size` bytes
pub fn chunk_count(size: u64, chunk_size: usize) -> Result<u32> {
    if chunk_size == 0 {
        return Err(NekoError::Configuration("chunk size cannot be 0".to_string()));
    }
    let count = size.div_ceil(chunk_size as u64);
    u32::try_from(count).map_err(|_| {
        NekoError::InvalidRequest(format!("file of {} bytes needs too many chunks", size))
    })
}

/// Plaintext length of chunk `index` in a file of `size` bytes
pub fn expected_chunk_len(size: u64, chunk_size: usize, index: u32) -> Result<usize> {
    let count = chunk_count(size, chunk_size)?;
    if index >= count {
        return Err(NekoError::InvalidSequence { index, count });
    }
    let start = index as u64 * chunk_size as u64;
    Ok((size - start).min(chunk_size as u64) as usize)
}

/// Check that `records` are exactly indices `0..count`, in order
pub fn verify_contiguous(records: &[ChunkRecord], count: u32) -> Result<()> {
    if records.len() != count as usize {
        let present: std::collections::BTreeSet<u32> = records.iter().map(|r| r.index).collect();
        let missing = (0..count).filter(|i| !present.contains(i)).collect();
        return Err(NekoError::IncompleteUpload { missing });
    }
    for (expected, record) in records.iter().enumerate() {
        if record.index != expected as u32 {
            return Err(NekoError::Integrity(format!(
                "chunk sequence broken at position {}: found index {}",
                expected, record.index
            )));
        }
    }
    Ok(())
}

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))
    }
}
