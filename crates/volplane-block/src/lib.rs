//! Volplane Block Backend
//!
//! This crate defines what the control plane needs from a block-storage
//! cluster and from external content, plus the in-process implementations
//! used for development and tests.
//!
//! # Components
//!
//! - **BlockBackend**: device, snapshot and clone operations on one pool
//! - **MemoryBackend**: in-memory cluster honoring clone dependency rules
//! - **ContentSource**: resolves OS image references to digests and streams
//! - **calculate_limits**: QoS limit values for a storage class
//!
//! # Device naming
//!
//! ```text
//! img_<id>    image device (clone or empty)
//! snap_<id>   content snapshot device, snapshot tag `v1`
//! os_<id>     OS snapshot device, snapshot tag `v1`
//! ```

pub mod backend;
pub mod error;
pub mod limits;
pub mod memory;
pub mod source;

pub use backend::{BlockBackend, ChildInfo, Credentials, DeviceInfo, SnapshotInfo};
pub use error::{BackendError, BackendResult, SourceError, SourceResult};
pub use limits::calculate_limits;
pub use memory::MemoryBackend;
pub use source::{ContentSource, ContentStream, LocalContentSource};
pub use volplane_common::{GIB, MIB};

/// Snapshot tag used for populated content and OS snapshot devices
pub const VERSION_TAG: &str = "v1";

/// Device metadata tag holding the image identity
pub const WWN_METADATA_KEY: &str = "wwn";

/// Device metadata tag holding the digest of the populated content
pub const DIGEST_METADATA_KEY: &str = "digest";

/// Device backing an image
#[must_use]
pub fn image_device(id: &str) -> String {
    format!("img_{id}")
}

/// Device backing a content snapshot
#[must_use]
pub fn snapshot_device(id: &str) -> String {
    format!("snap_{id}")
}

/// Device backing an OS snapshot
#[must_use]
pub fn os_snapshot_device(id: &str) -> String {
    format!("os_{id}")
}
