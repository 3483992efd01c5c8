//! Manifest export envelope
//!
//! Snapshots serialize the live manifest into a self-describing JSON
//! envelope. The envelope digest covers the serialized `manifest` member so
//! a restore can tell a corrupted or foreign export apart from a good one.

use crate::models::FileRecord;
use chrono::{DateTime, Utc};
use nekodrive_core::{ChunkRecord, ContentHash, NekoError, Result};
use serde::{Deserialize, Serialize};

pub const EXPORT_FORMAT: &str = "nekodrive-manifest";
pub const EXPORT_VERSION: u32 = 1;

/// Files and their chunk lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestContents {
    pub files: Vec<FileRecord>,
    pub chunks: Vec<ChunkRecord>,
}

impl ManifestContents {
    fn digest(&self) -> Result<ContentHash> {
        Ok(ContentHash::compute(&serde_json::to_vec(self)?))
    }
}

/// Versioned export envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestExport {
    pub format: String,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub digest: ContentHash,
    pub manifest: ManifestContents,
}

impl ManifestExport {
    pub fn new(manifest: ManifestContents) -> Result<Self> {
        Ok(Self {
            format: EXPORT_FORMAT.to_string(),
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            digest: manifest.digest()?,
            manifest,
        })
    }

    /// Check format, version and digest
    pub fn verify(&self) -> Result<()> {
        if self.format != EXPORT_FORMAT {
            return Err(NekoError::Integrity(format!(
                "unknown export format: {}",
                self.format
            )));
        }
        if self.version != EXPORT_VERSION {
            return Err(NekoError::Integrity(format!(
                "unsupported export version: {}",
                self.version
            )));
        }
        if self.manifest.digest()? != self.digest {
            return Err(NekoError::Integrity("export digest mismatch".to_string()));
        }
        Ok(())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and verify an export
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let export: Self = serde_json::from_slice(bytes)
            .map_err(|e| NekoError::Integrity(format!("malformed export: {}", e)))?;
        export.verify()?;
        Ok(export)
    }
}
