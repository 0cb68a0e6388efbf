//! Content digests for OS image sources
//!
//! Content snapshots are addressed by the SHA-256 digest of the source
//! bytes, rendered as `sha256:<hex>`.

use crate::error::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SHA256_PREFIX: &str = "sha256:";

/// A content digest in `sha256:<hex>` form
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Parse and validate a digest string
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let Some(hex_part) = value.strip_prefix(SHA256_PREFIX) else {
            return Err(Error::InvalidDigest(format!("missing {SHA256_PREFIX} prefix: {value}")));
        };
        if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(value));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Digest of an in-memory buffer
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut calc = DigestCalculator::new();
        calc.update(data);
        calc.finalize()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Snapshot ID derived from this digest. Colons are not allowed in IDs
    /// used as device names, so `sha256:abc` becomes `sha256-abc`.
    #[must_use]
    pub fn snapshot_id(&self) -> String {
        self.0.replace(':', "-")
    }
}

/// Streaming digest calculator
pub struct DigestCalculator {
    sha256: Sha256,
    len: u64,
}

impl DigestCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            len: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes hashed so far
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalize and return the computed digest
    #[must_use]
    pub fn finalize(self) -> ContentDigest {
        ContentDigest(format!("{SHA256_PREFIX}{}", hex::encode(self.sha256.finalize())))
    }
}

impl Default for DigestCalculator {
    fn default() -> Self {
        Self::new()
    }
}
