//! Volplane KMS - envelope encryption for volume passphrases
//!
//! Every encrypted volume carries its own passphrase. The passphrase is
//! sealed with AES-256-GCM under a cluster-wide key-encryption key (KEK)
//! before it is persisted, and opened again only when the device header is
//! written.
//!
//! Sealed format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Key-encryption key length in bytes
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("key-encryption key must be exactly {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("failed to read key-encryption key: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption failed")]
    Encrypt,

    #[error("sealed data too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("decryption failed: data was tampered with or sealed under another key")]
    Decrypt,
}

pub type KmsResult<T> = Result<T, KmsError>;

/// Seals and opens secrets under a single key-encryption key
pub struct Kms {
    cipher: Aes256Gcm,
}

impl Kms {
    /// Build from raw key material
    pub fn new(key: &[u8]) -> KmsResult<Self> {
        if key.len() != KEY_LEN {
            return Err(KmsError::InvalidKeyLength(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| KmsError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Load the key from a file holding exactly 32 raw bytes
    pub fn from_file(path: impl AsRef<Path>) -> KmsResult<Self> {
        let path = path.as_ref();
        let key = std::fs::read(path)?;
        let kms = Self::new(&key)?;
        info!("Loaded key-encryption key from {}", path.display());
        Ok(kms)
    }

    /// Generate fresh random key material
    #[must_use]
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Seal `plaintext` under a random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> KmsResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| KmsError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open data produced by [`Kms::encrypt`]
    pub fn decrypt(&self, sealed: &[u8]) -> KmsResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(KmsError::CiphertextTooShort(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KmsError::Decrypt)
    }
}

impl fmt::Debug for Kms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Kms { .. }")
    }
}
