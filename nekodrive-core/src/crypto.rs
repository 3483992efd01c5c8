//! Cryptographic primitives for NekoDrive
//!
//! Provides:
//! - Blake3 content hashing (chunk digests, rolling file digests)
//! - AES-256-GCM sealing with caller-supplied nonces and associated data
//! - Per-file key derivation from the operator master key
//! - Deterministic nonce derivation from (file id, chunk index)
//! - Master key derivation from a passphrase using Argon2

use crate::error::{NekoError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// AES-256-GCM key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

const NONCE_CONTEXT: &str = "nekodrive 2024-06 chunk nonce v1";
const FILE_KEY_DOMAIN: &[u8] = b"nekodrive/file-key/v1";

/// Blake3 hash wrapper used for chunk and file digests
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// Wrap raw hash bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hash = blake3::Hash::from_hex(hex.trim())
            .map_err(|e| NekoError::InvalidRequest(format!("invalid digest: {}", e)))?;
        Ok(Self(hash))
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        // blake3::Hash equality is constant-time
        self.0 == blake3::hash(data)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex: String = Deserialize::deserialize(deserializer)?;
        blake3::Hash::from_hex(&hex)
            .map(Self)
            .map_err(|_| serde::de::Error::custom("invalid blake3 digest"))
    }
}

/// AES-256-GCM encryption key
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(NekoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    /// Parse a hex-encoded 32-byte key
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| NekoError::Configuration(format!("master key is not valid hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Derive key from password using Argon2
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> Result<Self> {
        use argon2::password_hash::SaltString;
        use argon2::{Argon2, PasswordHasher};

        // Salt string must be base64-encoded
        let salt_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, salt);
        let salt_string = SaltString::from_b64(&salt_b64)
            .map_err(|e| NekoError::Encryption(e.to_string()))?;

        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(password, &salt_string)
            .map_err(|e| NekoError::Encryption(e.to_string()))?;

        let hash_bytes = password_hash
            .hash
            .ok_or_else(|| NekoError::Encryption("No hash output".to_string()))?;

        Self::from_slice(hash_bytes.as_bytes())
    }

    /// Derive the per-file data key.
    ///
    /// Every file (and every snapshot) is sealed under its own key so nonces
    /// only need to be unique within one file.
    pub fn derive_file_key(&self, file_id: Uuid) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(FILE_KEY_DOMAIN);
        hasher.update(file_id.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        // Zeroize key on drop
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Derive the nonce for chunk `index` of `file_id`.
///
/// Stateless: the same (file, index) pair always yields the same nonce, and
/// distinct indices of one file never share a nonce.
pub fn derive_nonce(file_id: Uuid, index: u32) -> [u8; NONCE_SIZE] {
    let mut hasher = blake3::Hasher::new_derive_key(NONCE_CONTEXT);
    hasher.update(file_id.as_bytes());
    hasher.update(&index.to_be_bytes());
    let digest = hasher.finalize();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest.as_bytes()[..NONCE_SIZE]);
    nonce
}

/// Associated data binding a ciphertext to its position in a file
pub fn chunk_aad(file_id: Uuid, index: u32) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..16].copy_from_slice(file_id.as_bytes());
    aad[16..].copy_from_slice(&index.to_be_bytes());
    aad
}

/// Encrypt `plaintext`, returning ciphertext with the 16-byte tag appended
pub fn seal(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| NekoError::Encryption(e.to_string()))?;

    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| NekoError::Encryption(e.to_string()))
}

/// Decrypt and authenticate a ciphertext produced by [`seal`]
pub fn open(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(NekoError::Integrity(
            "ciphertext shorter than authentication tag".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| NekoError::Encryption(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| NekoError::Integrity("authentication failed".to_string()))
}
