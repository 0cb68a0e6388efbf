//! Volplane Controller - reconciliation engine
//!
//! Converts the declared state in the metadata store into block devices,
//! snapshots and clones on the backend.
//!
//! # Architecture
//!
//! ```text
//! Store<R> --watch/list--> Informer<R> --handlers--> WorkQueue --> workers --> Reconciler
//!    ^                                                                           |
//!    +------------------------- status / finalizer updates ---------------------+
//! ```
//!
//! Every reconciler owns a queue and a fixed pool of workers. A key is never
//! reconciled by two workers at once; failures are retried with per-key
//! exponential backoff.

pub mod controller;
pub mod error;
mod finalizer;
pub mod image;
pub mod informer;
pub mod options;
pub mod os_snapshot;
mod populate;
pub mod queue;
pub mod snapshot;
pub mod worker;

#[cfg(test)]
mod testing;

pub use controller::Controller;
pub use error::{ReconcileError, ReconcileResult};
pub use image::ImageReconciler;
pub use informer::{HandlerId, Informer, ResourceEvent};
pub use options::{
    DEFAULT_COPY_BUFFER_SIZE, DEFAULT_RESYNC_INTERVAL, DEFAULT_WORKERS, QueueConfig,
    ReconcilerOptions,
};
pub use os_snapshot::OsSnapshotReconciler;
pub use queue::WorkQueue;
pub use snapshot::{SnapshotReconciler, snapshot_location};
pub use worker::{Reconciler, process_next, run_workers};
