//! Core resource definitions for Volplane
//!
//! Three resource kinds are reconciled against the block backend:
//!
//! - [`Image`]: a provisioned block device (a volume)
//! - [`Snapshot`]: a clone source, either content-addressed or taken from a volume
//! - [`OsSnapshot`]: a snapshot populated by streaming an OS image into a device

use crate::error::{Error, Result};
use crate::meta::Metadata;
use crate::resource::Resource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ---- WWN ----

/// Length of a WWN in hex characters
pub const WWN_LEN: usize = 16;

/// Generate a new random 16-hex-character device identity
#[must_use]
pub fn generate_wwn() -> String {
    let uuid = Uuid::new_v4();
    hex::encode(&uuid.as_bytes()[..WWN_LEN / 2])
}

/// Validate a WWN string
pub fn validate_wwn(wwn: &str) -> Result<()> {
    if wwn.len() != WWN_LEN || !wwn.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidWwn(wwn.to_string()));
    }
    Ok(())
}

// ---- QoS limit keys ----

/// Named I/O throttling value applied to a device as a metadata tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKey {
    Iops,
    ReadIops,
    WriteIops,
    IopsBurst,
    ReadIopsBurst,
    WriteIopsBurst,
    IopsBurstDuration,
    Bps,
    ReadBps,
    WriteBps,
    BpsBurst,
    ReadBpsBurst,
    WriteBpsBurst,
    BpsBurstDuration,
}

impl LimitKey {
    pub const ALL: [Self; 14] = [
        Self::Iops,
        Self::ReadIops,
        Self::WriteIops,
        Self::IopsBurst,
        Self::ReadIopsBurst,
        Self::WriteIopsBurst,
        Self::IopsBurstDuration,
        Self::Bps,
        Self::ReadBps,
        Self::WriteBps,
        Self::BpsBurst,
        Self::ReadBpsBurst,
        Self::WriteBpsBurst,
        Self::BpsBurstDuration,
    ];

    /// Backend configuration key for this limit
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Iops => "rbd_qos_iops_limit",
            Self::ReadIops => "rbd_qos_read_iops_limit",
            Self::WriteIops => "rbd_qos_write_iops_limit",
            Self::IopsBurst => "rbd_qos_iops_burst",
            Self::ReadIopsBurst => "rbd_qos_read_iops_burst",
            Self::WriteIopsBurst => "rbd_qos_write_iops_burst",
            Self::IopsBurstDuration => "rbd_qos_iops_burst_seconds",
            Self::Bps => "rbd_qos_bps_limit",
            Self::ReadBps => "rbd_qos_read_bps_limit",
            Self::WriteBps => "rbd_qos_write_bps_limit",
            Self::BpsBurst => "rbd_qos_bps_burst",
            Self::ReadBpsBurst => "rbd_qos_read_bps_burst",
            Self::WriteBpsBurst => "rbd_qos_write_bps_burst",
            Self::BpsBurstDuration => "rbd_qos_bps_burst_seconds",
        }
    }

    /// Device metadata tag under which the limit is stored
    #[must_use]
    pub fn metadata_key(&self) -> String {
        format!("conf_{}", self.as_str())
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// QoS limits keyed by limit name
pub type Limits = BTreeMap<LimitKey, i64>;

// ---- Image ----

/// Volume encryption mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionType {
    Encrypted,
    #[default]
    Unencrypted,
}

/// Requested encryption for an image
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSpec {
    #[serde(rename = "type", default)]
    pub encryption_type: EncryptionType,
    /// Passphrase sealed under the key-encryption key
    #[serde(default)]
    pub encrypted_passphrase: Vec<u8>,
}

/// Desired state of an image
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Requested size in bytes
    pub size: u64,
    /// Device identity, assigned once on create
    #[serde(default)]
    pub wwn: String,
    #[serde(default)]
    pub limits: Limits,
    /// External content reference to populate the image from
    #[serde(default)]
    pub image: Option<String>,
    /// Snapshot to clone from. Set at most once.
    #[serde(default)]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub encryption: EncryptionSpec,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageState {
    #[default]
    Pending,
    Available,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionState {
    #[default]
    #[serde(rename = "")]
    None,
    HeaderSet,
}

/// Connection details handed to consumers of an available image
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAccess {
    pub monitors: String,
    pub handle: String,
    pub user: String,
    pub user_key: String,
}

/// Observed state of an image
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatus {
    #[serde(default)]
    pub state: ImageState,
    #[serde(default)]
    pub encryption: EncryptionState,
    #[serde(default)]
    pub access: Option<ImageAccess>,
    /// Actual (rounded) device size
    #[serde(default)]
    pub size: u64,
}

/// A provisioned block device
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub metadata: Metadata,
    pub spec: ImageSpec,
    #[serde(default)]
    pub status: ImageStatus,
}

impl Image {
    /// Create an image request of the given size
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            metadata: Metadata::new(id),
            spec: ImageSpec {
                size,
                ..ImageSpec::default()
            },
            status: ImageStatus::default(),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status.state == ImageState::Available
    }
}

impl Resource for Image {
    const COLLECTION: &'static str = "volumes";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn prepare_for_create(&mut self) {
        if self.spec.wwn.is_empty() {
            self.spec.wwn = generate_wwn();
        }
        self.status.state = ImageState::Pending;
    }

    fn spec_changed(&self, previous: &Self) -> bool {
        self.spec != previous.spec
    }
}

// ---- Snapshot ----

/// Where a snapshot's content comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotSource {
    /// External content, deduplicated by digest
    Content { reference: String, digest: String },
    /// Point-in-time copy of a volume
    VolumeImage { image_id: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionPolicy {
    #[default]
    Protected,
    None,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub source: SnapshotSource,
    #[serde(default)]
    pub protection: ProtectionPolicy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    #[default]
    Pending,
    Ready,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    #[serde(default)]
    pub state: SnapshotState,
    #[serde(default)]
    pub size: u64,
}

/// A clone source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: Metadata,
    pub spec: SnapshotSpec,
    #[serde(default)]
    pub status: SnapshotStatus,
}

impl Snapshot {
    /// Content-addressed snapshot; the ID is derived from the digest
    #[must_use]
    pub fn for_content(reference: impl Into<String>, digest: &crate::ContentDigest) -> Self {
        Self {
            metadata: Metadata::new(digest.snapshot_id()),
            spec: SnapshotSpec {
                source: SnapshotSource::Content {
                    reference: reference.into(),
                    digest: digest.to_string(),
                },
                protection: ProtectionPolicy::Protected,
            },
            status: SnapshotStatus::default(),
        }
    }

    /// Snapshot of an existing volume
    pub fn for_volume(id: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(id),
            spec: SnapshotSpec {
                source: SnapshotSource::VolumeImage {
                    image_id: image_id.into(),
                },
                protection: ProtectionPolicy::Protected,
            },
            status: SnapshotStatus::default(),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.state == SnapshotState::Ready
    }

    #[must_use]
    pub const fn is_content(&self) -> bool {
        matches!(self.spec.source, SnapshotSource::Content { .. })
    }
}

impl Resource for Snapshot {
    const COLLECTION: &'static str = "snapshots";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn prepare_for_create(&mut self) {
        self.status.state = SnapshotState::Pending;
    }

    fn spec_changed(&self, previous: &Self) -> bool {
        self.spec != previous.spec
    }
}

// ---- OS snapshot ----

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsSnapshotSpec {
    /// External OS image reference
    pub reference: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsSnapshotState {
    #[default]
    Pending,
    Populated,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsSnapshotStatus {
    #[serde(default)]
    pub state: OsSnapshotState,
    #[serde(default)]
    pub digest: Option<String>,
}

/// A snapshot populated from an OS image
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsSnapshot {
    pub metadata: Metadata,
    pub spec: OsSnapshotSpec,
    #[serde(default)]
    pub status: OsSnapshotStatus,
}

impl OsSnapshot {
    pub fn new(id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(id),
            spec: OsSnapshotSpec {
                reference: reference.into(),
            },
            status: OsSnapshotStatus::default(),
        }
    }
}

impl Resource for OsSnapshot {
    const COLLECTION: &'static str = "os_snapshots";

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn prepare_for_create(&mut self) {
        self.status.state = OsSnapshotState::Pending;
    }

    fn spec_changed(&self, previous: &Self) -> bool {
        self.spec != previous.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentDigest;

    #[test]
    fn test_generate_wwn() {
        let a = generate_wwn();
        let b = generate_wwn();
        assert_eq!(a.len(), WWN_LEN);
        assert!(validate_wwn(&a).is_ok());
        assert_ne!(a, b);
        assert!(validate_wwn("xyz").is_err());
        assert!(validate_wwn("0123456789abcdeg").is_err());
    }

    #[test]
    fn test_image_prepare_for_create() {
        let mut image = Image::new("vol-1", 1024);
        image.status.state = ImageState::Available;
        image.prepare_for_create();
        assert_eq!(image.status.state, ImageState::Pending);
        assert_eq!(image.spec.wwn.len(), WWN_LEN);

        // An explicit WWN is kept
        let mut image = Image::new("vol-2", 1024);
        image.spec.wwn = "00112233aabbccdd".to_string();
        image.prepare_for_create();
        assert_eq!(image.spec.wwn, "00112233aabbccdd");
    }

    #[test]
    fn test_spec_changed_ignores_status() {
        let image = Image::new("vol-1", 1024);
        let mut updated = image.clone();
        updated.status.size = 2048;
        assert!(!updated.spec_changed(&image));
        updated.spec.size = 2048;
        assert!(updated.spec_changed(&image));
    }

    #[test]
    fn test_content_snapshot_id_from_digest() {
        let digest = ContentDigest::compute(b"os-image");
        let snap = Snapshot::for_content("registry/os:1", &digest);
        assert_eq!(snap.metadata.id, digest.snapshot_id());
        assert!(snap.is_content());
        assert!(!snap.is_ready());
    }

    #[test]
    fn test_image_json_layout() {
        let mut image = Image::new("vol-1", 1024);
        image.spec.limits.insert(LimitKey::Iops, 100);
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["spec"]["limits"]["iops"], 100);
        assert_eq!(json["spec"]["encryption"]["type"], "Unencrypted");
        assert_eq!(json["status"]["encryption"], "");

        let back: Image = serde_json::from_value(json).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_limit_metadata_key() {
        assert_eq!(LimitKey::Iops.metadata_key(), "conf_rbd_qos_iops_limit");
        assert_eq!(LimitKey::ALL.len(), 14);
    }
}
