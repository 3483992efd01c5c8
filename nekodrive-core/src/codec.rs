//! Chunk codec
//!
//! Splits plaintext into fixed-size chunks, seals each one independently with
//! AES-256-GCM and tracks two levels of integrity:
//! - a Blake3 digest of every chunk's plaintext
//! - a rolling file digest over the ordered chunk digests
//!
//! Decoding walks the chunks in strict index order and fails closed: the
//! buffered [`ChunkCodec::decode_all`] never hands out partial output, and the
//! incremental [`ChunkDecoder`] only emits chunks that passed every check.

use crate::chunk::{self, ChunkRecord, DataKind, ShardLocator};
use crate::crypto::{self, ContentHash, EncryptionKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{NekoError, Result};
use crate::MIN_CHUNK_SIZE;
use bytes::Bytes;
use chrono::Utc;
use uuid::Uuid;

const FILE_DIGEST_CONTEXT: &str = "nekodrive 2024-06 file digest v1";

/// Rolling whole-file digest over ordered chunk digests
#[derive(Clone)]
pub struct FileDigest {
    hasher: blake3::Hasher,
    next_index: u32,
}

impl FileDigest {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new_derive_key(FILE_DIGEST_CONTEXT),
            next_index: 0,
        }
    }

    /// Fold in the next chunk; chunks must arrive in index order
    pub fn update(&mut self, index: u32, digest: &ContentHash, plaintext_len: u32) -> Result<()> {
        if index != self.next_index {
            return Err(NekoError::Integrity(format!(
                "file digest expected chunk {}, got {}",
                self.next_index, index
            )));
        }
        self.hasher.update(&index.to_be_bytes());
        self.hasher.update(&plaintext_len.to_be_bytes());
        self.hasher.update(digest.as_bytes());
        self.next_index += 1;
        Ok(())
    }

    pub fn finalize(&self) -> ContentHash {
        ContentHash::from_bytes(*self.hasher.finalize().as_bytes())
    }

    /// Compute the file digest from an ordered list of chunk records
    pub fn of_records(records: &[ChunkRecord]) -> Result<ContentHash> {
        let mut digest = Self::new();
        for record in records {
            digest.update(record.index, &record.digest, record.plaintext_len)?;
        }
        Ok(digest.finalize())
    }
}

impl Default for FileDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// One sealed chunk, ready to be written as a shard
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub index: u32,
    pub plaintext_len: u32,
    pub ciphertext: Bytes,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub digest: ContentHash,
}

impl EncodedChunk {
    /// Build the manifest record once the shard has been stored
    pub fn to_record(&self, file_id: Uuid, locator: ShardLocator, kind: DataKind) -> ChunkRecord {
        ChunkRecord {
            file_id,
            index: self.index,
            plaintext_len: self.plaintext_len,
            ciphertext_len: self.ciphertext.len() as u32,
            nonce: self.nonce,
            tag: self.tag,
            digest: self.digest,
            locator,
            kind,
            committed_at: Utc::now(),
        }
    }
}

/// A whole buffer run through the codec
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub file_id: Uuid,
    pub size: u64,
    pub digest: ContentHash,
    pub chunks: Vec<EncodedChunk>,
}

/// Fixed-size chunking plus per-chunk authenticated encryption
#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec {
    chunk_size: usize,
    max_shard_size: usize,
}

impl ChunkCodec {
    /// Create a codec whose shards always fit under `max_shard_size`
    pub fn new(chunk_size: usize, max_shard_size: usize) -> Result<Self> {
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(NekoError::Configuration(format!(
                "chunk size {} is below the minimum of {}",
                chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if chunk_size + TAG_SIZE > max_shard_size {
            return Err(NekoError::Configuration(format!(
                "chunk size {} plus {}-byte tag exceeds the shard ceiling of {}",
                chunk_size, TAG_SIZE, max_shard_size
            )));
        }
        Ok(Self {
            chunk_size,
            max_shard_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_shard_size(&self) -> usize {
        self.max_shard_size
    }

    /// Number of chunks a file of `size` bytes is split into
    pub fn chunk_count(&self, size: u64) -> Result<u32> {
        chunk::chunk_count(size, self.chunk_size)
    }

    /// Plaintext length chunk `index` must have in a file of `size` bytes
    pub fn expected_len(&self, size: u64, index: u32) -> Result<usize> {
        chunk::expected_chunk_len(size, self.chunk_size, index)
    }

    /// Seal one chunk. `key` is the per-file key.
    pub fn encode_chunk(
        &self,
        key: &EncryptionKey,
        file_id: Uuid,
        index: u32,
        plaintext: &[u8],
    ) -> Result<EncodedChunk> {
        if plaintext.len() > self.chunk_size {
            return Err(NekoError::InvalidRequest(format!(
                "chunk {} is {} bytes, chunk size is {}",
                index,
                plaintext.len(),
                self.chunk_size
            )));
        }

        let nonce = crypto::derive_nonce(file_id, index);
        let aad = crypto::chunk_aad(file_id, index);
        let ciphertext = crypto::seal(key, &nonce, &aad, plaintext)?;

        if ciphertext.len() > self.max_shard_size {
            return Err(NekoError::ShardTooLarge {
                size: ciphertext.len(),
                max: self.max_shard_size,
            });
        }

        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&ciphertext[ciphertext.len() - TAG_SIZE..]);

        Ok(EncodedChunk {
            index,
            plaintext_len: plaintext.len() as u32,
            ciphertext: Bytes::from(ciphertext),
            nonce,
            tag,
            digest: ContentHash::compute(plaintext),
        })
    }

    /// Split and seal a whole in-memory buffer
    pub fn encode(&self, key: &EncryptionKey, file_id: Uuid, data: &[u8]) -> Result<EncodedFile> {
        let mut rolling = FileDigest::new();
        let mut chunks = Vec::with_capacity(data.len().div_ceil(self.chunk_size));

        for (index, plaintext) in data.chunks(self.chunk_size).enumerate() {
            let encoded = self.encode_chunk(key, file_id, index as u32, plaintext)?;
            rolling.update(encoded.index, &encoded.digest, encoded.plaintext_len)?;
            chunks.push(encoded);
        }

        Ok(EncodedFile {
            file_id,
            size: data.len() as u64,
            digest: rolling.finalize(),
            chunks,
        })
    }

    /// Start an incremental decode over the file's ordered chunk records
    pub fn decoder(
        &self,
        key: EncryptionKey,
        file_id: Uuid,
        expected_digest: ContentHash,
        records: Vec<ChunkRecord>,
    ) -> Result<ChunkDecoder> {
        ChunkDecoder::new(key, file_id, expected_digest, records)
    }

    /// Decode every chunk and return the whole plaintext, or nothing
    pub fn decode_all(
        &self,
        key: EncryptionKey,
        file_id: Uuid,
        expected_digest: ContentHash,
        records: Vec<ChunkRecord>,
        ciphertexts: &[Bytes],
    ) -> Result<Bytes> {
        if records.len() != ciphertexts.len() {
            return Err(NekoError::Integrity(format!(
                "{} chunk records but {} ciphertexts",
                records.len(),
                ciphertexts.len()
            )));
        }

        let total: usize = records.iter().map(|r| r.plaintext_len as usize).sum();
        let indices: Vec<u32> = records.iter().map(|r| r.index).collect();
        let mut decoder = self.decoder(key, file_id, expected_digest, records)?;

        let mut output = Vec::with_capacity(total);
        for (index, ciphertext) in indices.into_iter().zip(ciphertexts) {
            output.extend_from_slice(&decoder.push(index, ciphertext)?);
        }
        decoder.finish()?;

        Ok(Bytes::from(output))
    }
}

/// Incremental decoder consuming shards in strict index order
pub struct ChunkDecoder {
    key: EncryptionKey,
    file_id: Uuid,
    expected_digest: ContentHash,
    records: Vec<ChunkRecord>,
    position: usize,
    rolling: FileDigest,
}

impl ChunkDecoder {
    /// Validates the record list against the file digest before any shard
    /// is touched.
    pub fn new(
        key: EncryptionKey,
        file_id: Uuid,
        expected_digest: ContentHash,
        records: Vec<ChunkRecord>,
    ) -> Result<Self> {
        chunk::verify_contiguous(&records, records.len() as u32)?;
        if let Some(foreign) = records.iter().find(|r| r.file_id != file_id) {
            return Err(NekoError::Integrity(format!(
                "chunk {} belongs to file {}",
                foreign.index, foreign.file_id
            )));
        }
        if FileDigest::of_records(&records)? != expected_digest {
            return Err(NekoError::Integrity(
                "chunk list does not match the file digest".to_string(),
            ));
        }

        Ok(Self {
            key,
            file_id,
            expected_digest,
            records,
            position: 0,
            rolling: FileDigest::new(),
        })
    }

    /// Resume decoding at a chunk boundary
    pub fn starting_at(mut self, index: u32) -> Result<Self> {
        let index = index as usize;
        if index > self.records.len() {
            return Err(NekoError::InvalidSequence {
                index: index as u32,
                count: self.records.len() as u32,
            });
        }
        let mut rolling = FileDigest::new();
        for record in &self.records[..index] {
            rolling.update(record.index, &record.digest, record.plaintext_len)?;
        }
        self.rolling = rolling;
        self.position = index;
        Ok(self)
    }

    /// Index of the next chunk the decoder expects
    pub fn next_index(&self) -> Option<u32> {
        self.records.get(self.position).map(|r| r.index)
    }

    /// Records not yet decoded, in order
    pub fn remaining(&self) -> &[ChunkRecord] {
        &self.records[self.position..]
    }

    pub fn is_finished(&self) -> bool {
        self.position == self.records.len()
    }

    /// Verify and decrypt the next shard
    pub fn push(&mut self, index: u32, ciphertext: &[u8]) -> Result<Bytes> {
        let record = self.records.get(self.position).ok_or_else(|| {
            NekoError::Integrity(format!("unexpected chunk {} after end of file", index))
        })?;

        if record.index != index {
            return Err(NekoError::Integrity(format!(
                "expected chunk {}, got {}",
                record.index, index
            )));
        }
        if ciphertext.len() != record.ciphertext_len as usize {
            return Err(NekoError::Integrity(format!(
                "chunk {} ciphertext is {} bytes, manifest says {}",
                index,
                ciphertext.len(),
                record.ciphertext_len
            )));
        }

        let nonce = crypto::derive_nonce(self.file_id, index);
        if nonce != record.nonce {
            return Err(NekoError::Integrity(format!("chunk {} nonce mismatch", index)));
        }
        if ciphertext[ciphertext.len().saturating_sub(TAG_SIZE)..] != record.tag {
            return Err(NekoError::Integrity(format!("chunk {} tag mismatch", index)));
        }

        let aad = crypto::chunk_aad(self.file_id, index);
        let plaintext = crypto::open(&self.key, &nonce, &aad, ciphertext)
            .map_err(|e| NekoError::Integrity(format!("chunk {}: {}", index, e)))?;

        if plaintext.len() != record.plaintext_len as usize || !record.digest.verify(&plaintext) {
            return Err(NekoError::Integrity(format!("chunk {} digest mismatch", index)));
        }

        let digest = ContentHash::compute(&plaintext);
        self.rolling.update(index, &digest, plaintext.len() as u32)?;
        self.position += 1;

        if self.is_finished() {
            self.finish()?;
        }

        Ok(Bytes::from(plaintext))
    }

    /// Confirm every chunk was consumed and the rolling digest matches
    pub fn finish(&self) -> Result<()> {
        if !self.is_finished() {
            return Err(NekoError::Integrity(format!(
                "decode stopped at chunk {} of {}",
                self.position,
                self.records.len()
            )));
        }
        if self.rolling.finalize() != self.expected_digest {
            return Err(NekoError::Integrity("file digest mismatch".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TEST_CHUNK: usize = MIN_CHUNK_SIZE;

    fn codec() -> ChunkCodec {
        ChunkCodec::new(TEST_CHUNK, TEST_CHUNK + 1024).unwrap()
    }

    fn generate_data(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn records_for(encoded: &EncodedFile) -> (Vec<ChunkRecord>, Vec<Bytes>) {
        encoded
            .chunks
            .iter()
            .map(|c| {
                (
                    c.to_record(
                        encoded.file_id,
                        ShardLocator::new(format!("mem:{}", c.index)),
                        DataKind::User,
                    ),
                    c.ciphertext.clone(),
                )
            })
            .unzip()
    }

    #[test]
    fn test_codec_rejects_chunk_size_over_ceiling() {
        let result = ChunkCodec::new(TEST_CHUNK, TEST_CHUNK);
        assert!(matches!(result, Err(NekoError::Configuration(_))));
        assert!(ChunkCodec::new(1024, 1 << 20).is_err());
    }

    #[test]
    fn test_encode_is_idempotent_per_position() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let a = codec().encode_chunk(&key, file, 5, b"retry me").unwrap();
        let b = codec().encode_chunk(&key, file, 5, b"retry me").unwrap();
        assert_eq!(a.ciphertext, b.ciphertext);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_three_chunk_roundtrip() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let data = generate_data(TEST_CHUNK * 2 + 100);

        let encoded = codec().encode(&key, file, &data).unwrap();
        assert_eq!(encoded.chunks.len(), 3);
        assert_eq!(encoded.chunks[2].plaintext_len, 100);
        assert!(encoded
            .chunks
            .iter()
            .all(|c| c.ciphertext.len() <= codec().max_shard_size()));

        let (records, ciphertexts) = records_for(&encoded);
        let decoded = codec()
            .decode_all(key, file, encoded.digest, records, &ciphertexts)
            .unwrap();
        assert_eq!(decoded.as_ref(), data.as_slice());
    }

    #[test]
    fn test_empty_file_roundtrip() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let encoded = codec().encode(&key, file, &[]).unwrap();
        assert!(encoded.chunks.is_empty());

        let decoded = codec()
            .decode_all(key, file, encoded.digest, Vec::new(), &[])
            .unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_tampered_chunk_fails_closed() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let data = generate_data(TEST_CHUNK * 3);
        let encoded = codec().encode(&key, file, &data).unwrap();
        let (records, mut ciphertexts) = records_for(&encoded);

        let mut tampered = ciphertexts[1].to_vec();
        tampered[10] ^= 0x01;
        ciphertexts[1] = Bytes::from(tampered);

        let result = codec().decode_all(key, file, encoded.digest, records, &ciphertexts);
        assert!(matches!(result, Err(NekoError::Integrity(_))));
    }

    #[test]
    fn test_swapped_chunks_are_rejected() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let data = generate_data(TEST_CHUNK * 2);
        let encoded = codec().encode(&key, file, &data).unwrap();
        let (records, mut ciphertexts) = records_for(&encoded);
        ciphertexts.swap(0, 1);

        let result = codec().decode_all(key, file, encoded.digest, records, &ciphertexts);
        assert!(matches!(result, Err(NekoError::Integrity(_))));
    }

    #[test]
    fn test_wrong_file_digest_rejected_before_decoding() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let encoded = codec().encode(&key, file, &generate_data(1000)).unwrap();
        let (records, _) = records_for(&encoded);

        let result = codec().decoder(key, file, ContentHash::compute(b"other"), records);
        assert!(matches!(result, Err(NekoError::Integrity(_))));
    }

    #[test]
    fn test_decoder_restarts_at_chunk_boundary() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let data = generate_data(TEST_CHUNK * 3);
        let encoded = codec().encode(&key, file, &data).unwrap();
        let (records, ciphertexts) = records_for(&encoded);

        let mut decoder = codec()
            .decoder(key, file, encoded.digest, records)
            .unwrap()
            .starting_at(2)
            .unwrap();
        assert_eq!(decoder.next_index(), Some(2));

        let tail = decoder.push(2, &ciphertexts[2]).unwrap();
        assert_eq!(tail.as_ref(), &data[TEST_CHUNK * 2..]);
        assert!(decoder.is_finished());
        decoder.finish().unwrap();
    }

    #[test]
    fn test_decoder_requires_strict_order() {
        let key = EncryptionKey::generate();
        let file = Uuid::new_v4();
        let encoded = codec()
            .encode(&key, file, &generate_data(TEST_CHUNK * 2))
            .unwrap();
        let (records, ciphertexts) = records_for(&encoded);

        let mut decoder = codec().decoder(key, file, encoded.digest, records).unwrap();
        assert!(decoder.push(1, &ciphertexts[1]).is_err());
        assert!(decoder.finish().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_decode_inverts_encode(data in proptest::collection::vec(any::<u8>(), 0..(TEST_CHUNK * 3))) {
            let key = EncryptionKey::generate();
            let file = Uuid::new_v4();
            let encoded = codec().encode(&key, file, &data).unwrap();
            let (records, ciphertexts) = records_for(&encoded);

            let decoded = codec()
                .decode_all(key, file, encoded.digest, records, &ciphertexts)
                .unwrap();
            prop_assert_eq!(decoded.as_ref(), data.as_slice());
        }
    }
}
