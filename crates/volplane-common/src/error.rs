//! Error types for Volplane
//!
//! Validation errors for the resource model. Storage, backend and
//! reconciliation errors live in their own crates.

use thiserror::Error;

/// Common result type for model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for model validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid WWN {0:?}: expected 16 hex characters")]
    InvalidWwn(String),

    #[error("invalid content digest: {0}")]
    InvalidDigest(String),
}
