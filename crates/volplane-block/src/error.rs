//! Block backend error types

use thiserror::Error;

/// Block backend error
#[derive(Error, Debug)]
pub enum BackendError {
    /// Device or snapshot not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Device or snapshot already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Device or snapshot still has clones
    #[error("Has children: {0}")]
    HasChildren(String),

    /// Device still has snapshots and cannot be removed
    #[error("Device has snapshots: {0}")]
    HasSnapshots(String),

    /// Snapshot is protected and cannot be removed
    #[error("Snapshot is protected: {0}")]
    SnapshotProtected(String),

    /// Invalid device size
    #[error("Invalid device size: {0}")]
    InvalidSize(String),

    /// Cannot shrink device
    #[error("Cannot shrink device from {0} to {1} bytes")]
    CannotShrink(u64, u64),

    /// Offset out of bounds
    #[error("Offset {offset} + length {length} exceeds device size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cluster unreachable or call failed transiently
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Content source error
#[derive(Error, Debug)]
pub enum SourceError {
    /// Reference is empty or escapes the source root
    #[error("Invalid content reference: {0}")]
    InvalidReference(String),

    /// Reference does not name any content
    #[error("Content not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for content source operations
pub type SourceResult<T> = Result<T, SourceError>;
