//! Volplane Common - Resource model and shared utilities
//!
//! This crate provides the persisted resource types (images, snapshots,
//! OS snapshots), the metadata envelope every resource carries, and small
//! pure helpers (size rounding, WWN generation, content digests) used across
//! all Volplane components.

pub mod digest;
pub mod error;
pub mod meta;
pub mod resource;
pub mod size;
pub mod types;

pub use digest::{ContentDigest, DigestCalculator};
pub use error::{Error, Result};
pub use meta::Metadata;
pub use resource::Resource;
pub use size::{GIB, KIB, MIB, round_size};
pub use types::*;

/// Finalizer placed on every resource owned by this control plane
pub const FINALIZER: &str = "volplane.io/controller";
