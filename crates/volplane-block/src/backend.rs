//! Block backend contract
//!
//! The control plane never talks to a storage cluster directly; it drives
//! an implementation of [`BlockBackend`]. One backend instance is bound to
//! one pool and shared by every reconciler worker.

use crate::error::BackendResult;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Properties of an opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// Provisioned size in bytes
    pub size: u64,
    /// `(parent device, parent snapshot)` for clones
    pub parent: Option<(String, String)>,
}

/// A snapshot on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub size: u64,
    pub protected: bool,
}

/// A clone of one of a device's snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    /// Clone device name
    pub device: String,
    /// Snapshot on the parent the clone was taken from
    pub snapshot: String,
}

/// Authentication material for a client identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub key: String,
}

/// Block-device operations the reconcilers rely on
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Create an empty device
    async fn create_device(&self, name: &str, size: u64) -> BackendResult<()>;

    /// Open a device, failing with `NotFound` if it does not exist
    async fn open_device(&self, name: &str) -> BackendResult<DeviceInfo>;

    /// Grow a device
    async fn resize_device(&self, name: &str, size: u64) -> BackendResult<()>;

    /// Remove a device. Fails while it has snapshots or clones.
    async fn remove_device(&self, name: &str) -> BackendResult<()>;

    /// Create `child` as a copy-on-write clone of `parent@snapshot`
    async fn clone_device(&self, parent: &str, snapshot: &str, child: &str) -> BackendResult<()>;

    async fn create_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()>;

    async fn protect_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()>;

    /// Unprotect a snapshot. Fails while the snapshot has clones.
    async fn unprotect_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()>;

    /// Remove a snapshot. Fails while it is protected.
    async fn remove_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()>;

    async fn list_snapshots(&self, device: &str) -> BackendResult<Vec<SnapshotInfo>>;

    /// Clones of any snapshot of `device`
    async fn list_children(&self, device: &str) -> BackendResult<Vec<ChildInfo>>;

    /// Set a string metadata tag on a device
    async fn set_metadata(&self, device: &str, key: &str, value: &str) -> BackendResult<()>;

    async fn get_metadata(&self, device: &str) -> BackendResult<BTreeMap<String, String>>;

    /// Write an encryption header protected by `passphrase`
    async fn format_encrypted(&self, device: &str, passphrase: &[u8]) -> BackendResult<()>;

    /// Fetch the key for a client identity
    async fn fetch_credentials(&self, client: &str) -> BackendResult<Credentials>;

    /// Write `data` at `offset`
    async fn write_at(&self, device: &str, offset: u64, data: &[u8]) -> BackendResult<()>;
}
