//! Volplane Metadata Store - persisted resource collections
//!
//! Each resource kind lives in its own redb table ("collection"), stored as
//! JSON keyed by resource ID. Collections offer create/get/update/delete/list
//! with optimistic concurrency on `resource_version`, per-ID write
//! serialization, finalizer-gated deletion and a best-effort watch.
//!
//! The store assumes a single writer process per database file. The per-ID
//! locks only serialize callers inside this process.

pub mod error;
pub mod store;
pub mod watch;

// Re-exports
pub use error::{StoreError, StoreResult};
pub use store::{MetaStore, Store, StoreOptions};
pub use watch::{EventType, Subscription, WatchEvent};
