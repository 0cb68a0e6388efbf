//! Persistable resource capability.
//!
//! The metadata store is generic over this trait rather than over concrete
//! resource types. Anything that carries a [`Metadata`] envelope and can be
//! serialized to JSON can live in a collection.

use crate::meta::Metadata;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A resource that can be stored in a metadata store collection
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Name of the collection (key/value namespace) holding this kind
    const COLLECTION: &'static str;

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Hook applied by the store right before the first write.
    fn prepare_for_create(&mut self) {}

    /// Whether the desired state differs from `previous`.
    /// Drives the metadata `generation` counter.
    fn spec_changed(&self, previous: &Self) -> bool;

    fn id(&self) -> &str {
        &self.metadata().id
    }

    fn finalizers(&self) -> &[String] {
        &self.metadata().finalizers
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.metadata().deleted_at
    }

    fn set_deleted_at(&mut self, at: DateTime<Utc>) {
        self.metadata_mut().deleted_at = Some(at);
    }

    fn resource_version(&self) -> u64 {
        self.metadata().resource_version
    }

    fn set_resource_version(&mut self, version: u64) {
        self.metadata_mut().resource_version = version;
    }
}
