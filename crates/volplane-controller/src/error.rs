//! Reconcile error types

use thiserror::Error;
use volplane_block::{BackendError, SourceError};
use volplane_kms::KmsError;
use volplane_meta_store::StoreError;

/// Error returned by a reconcile cycle or by controller construction
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("content source error: {0}")]
    Source(#[from] SourceError),

    #[error("kms error: {0}")]
    Kms(#[from] KmsError),

    #[error("cannot shrink image {id} from {current} to {requested} bytes")]
    ShrinkUnsupported {
        id: String,
        current: u64,
        requested: u64,
    },

    #[error("snapshot {0} is being deleted")]
    SnapshotDeleting(String),

    #[error("content of {reference} changed: expected {expected}, found {found}")]
    DigestMismatch {
        reference: String,
        expected: String,
        found: String,
    },

    #[error("invalid resource: {0}")]
    Invalid(#[from] volplane_common::Error),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ReconcileError {
    pub(crate) fn backend(context: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            context: context.into(),
            source,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::Store(e) => e.is_not_found(),
            Self::Backend { source, .. } => source.is_not_found(),
            Self::Source(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Another writer changed the object since it was read
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }

    /// Retrying cannot succeed without a change to the resource
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::ShrinkUnsupported { .. } | Self::Invalid(_))
    }
}

/// Attach context to backend failures
pub(crate) trait BackendContext<T> {
    fn context<F, S>(self, f: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> BackendContext<T> for Result<T, BackendError> {
    fn context<F, S>(self, f: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| ReconcileError::backend(f(), e))
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
