//! Read path: fetch shards ahead of the consumer and decode them in order

use crate::state::SharedShardStore;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt, TryStreamExt};
use metrics::counter;
use nekodrive_core::{ChunkCodec, ChunkRecord, EncryptionKey, NekoError, Result};
use nekodrive_metadata::{FileRecord, FileState, ManifestStore};
use nekodrive_storage::ShardStore;
use std::sync::Arc;
use uuid::Uuid;

/// Plaintext of a file, one chunk per item
pub type ContentStream = BoxStream<'static, Result<Bytes>>;

/// An active file and its ordered chunk list
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub file: FileRecord,
    pub chunks: Vec<ChunkRecord>,
}

/// Fetch the ciphertext of every record, in record order
pub(crate) async fn fetch_shards(
    shards: &SharedShardStore,
    records: &[ChunkRecord],
    prefetch: usize,
) -> Result<Vec<Bytes>> {
    stream::iter(records.to_vec())
        .map(|record| {
            let shards = shards.clone();
            async move { shards.get(&record.locator).await }
        })
        .buffered(prefetch.max(1))
        .try_collect()
        .await
}

pub struct FileReader {
    manifest: Arc<ManifestStore>,
    shards: SharedShardStore,
    codec: ChunkCodec,
    master_key: EncryptionKey,
    prefetch: usize,
}

impl FileReader {
    pub fn new(
        manifest: Arc<ManifestStore>,
        shards: SharedShardStore,
        codec: ChunkCodec,
        master_key: EncryptionKey,
        prefetch: usize,
    ) -> Self {
        Self {
            manifest,
            shards,
            codec,
            master_key,
            prefetch: prefetch.max(1),
        }
    }

    /// Look up a readable file. Trashed files are not readable.
    pub fn open(&self, id: Uuid) -> Result<OpenFile> {
        let file = self
            .manifest
            .get_file(id)?
            .ok_or_else(|| NekoError::NotFound(format!("file {}", id)))?;
        if file.state != FileState::Active {
            return Err(NekoError::Conflict(format!("file {} is in the trash", id)));
        }
        let chunks = self.manifest.file_chunks(id)?;
        Ok(OpenFile { file, chunks })
    }

    /// Stream the plaintext chunk by chunk.
    ///
    /// Every chunk is verified before it is yielded. The stream ends after
    /// the first error.
    pub fn stream(&self, open: &OpenFile) -> Result<ContentStream> {
        let file_id = open.file.id;
        let decoder = self.codec.decoder(
            self.master_key.derive_file_key(file_id),
            file_id,
            open.file.digest,
            open.chunks.clone(),
        )?;

        let shards = self.shards.clone();
        let fetches = stream::iter(open.chunks.clone())
            .map(move |record| {
                let shards = shards.clone();
                async move {
                    let data = shards.get(&record.locator).await?;
                    Ok::<_, NekoError>((record.index, data))
                }
            })
            .buffered(self.prefetch);

        let decoded = fetches
            .scan(Some(decoder), |state, item| {
                let next = match state.as_mut() {
                    Some(decoder) => Some(item.and_then(|(index, data)| decoder.push(index, &data))),
                    None => None,
                };
                if matches!(next, Some(Err(_))) {
                    *state = None;
                }
                future::ready(next)
            })
            .inspect_ok(|chunk| counter!("download_bytes_total").increment(chunk.len() as u64));

        Ok(decoded.boxed())
    }

    /// Read and verify a whole file; nothing is returned unless every chunk
    /// and the file digest check out
    pub async fn read_all(&self, id: Uuid) -> Result<Bytes> {
        let open = self.open(id)?;
        let ciphertexts = fetch_shards(&self.shards, &open.chunks, self.prefetch).await?;

        let data = self.codec.decode_all(
            self.master_key.derive_file_key(id),
            id,
            open.file.digest,
            open.chunks,
            &ciphertexts,
        )?;
        counter!("download_bytes_total").increment(data.len() as u64);
        Ok(data)
    }
}
