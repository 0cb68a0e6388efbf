//! Event bridge from a store collection to handlers.
//!
//! On start the informer subscribes to the collection, lists it and reports
//! every object as `Exists`, then forwards each watch event. Because watch
//! delivery is best-effort it re-lists every `resync_interval` and reports
//! everything as `Exists` again.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use volplane_common::Resource;
use volplane_meta_store::{EventType, Store, StoreResult, WatchEvent};

/// A notification delivered to informer handlers
#[derive(Clone, Debug)]
pub enum ResourceEvent<R> {
    /// Object seen during a (re)list
    Exists(R),
    Created(R),
    Updated(R),
    /// Object removed or marked for deletion
    Deleted(R),
}

impl<R> ResourceEvent<R> {
    pub const fn object(&self) -> &R {
        match self {
            Self::Exists(r) | Self::Created(r) | Self::Updated(r) | Self::Deleted(r) => r,
        }
    }
}

impl<R> From<WatchEvent<R>> for ResourceEvent<R> {
    fn from(event: WatchEvent<R>) -> Self {
        match event.event_type {
            EventType::Created => Self::Created(event.object),
            EventType::Updated => Self::Updated(event.object),
            EventType::Deleted => Self::Deleted(event.object),
        }
    }
}

type Handler<R> = Arc<dyn Fn(&ResourceEvent<R>) + Send + Sync>;

/// Registration returned by [`Informer::add_handler`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Relays one collection's objects and mutations to registered handlers
pub struct Informer<R: Resource> {
    store: Store<R>,
    resync_interval: Duration,
    next_id: AtomicU64,
    handlers: RwLock<BTreeMap<HandlerId, Handler<R>>>,
}

impl<R: Resource> Informer<R> {
    pub fn new(store: Store<R>, resync_interval: Duration) -> Self {
        Self {
            store,
            resync_interval,
            next_id: AtomicU64::new(0),
            handlers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a handler that receives every subsequent event
    pub fn add_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ResourceEvent<R>) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().insert(id, Arc::new(handler));
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    fn dispatch(&self, event: &ResourceEvent<R>) {
        let handlers: Vec<_> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Report every stored object as `Exists`
    pub fn resync(&self) -> StoreResult<usize> {
        let objects = self.store.list()?;
        let count = objects.len();
        for object in objects {
            self.dispatch(&ResourceEvent::Exists(object));
        }
        Ok(count)
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    ///
    /// Fails only if the initial list fails; later resync failures are
    /// logged and retried on the next tick.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> StoreResult<()> {
        let collection = self.store.collection();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        // Subscribe before listing so nothing between the two is missed
        let mut subscription = self.store.watch();
        let count = self.resync()?;
        info!(collection, count, "informer started");

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.resync_interval,
            self.resync_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    debug!(collection, id = %event.object.id(), event = ?event.event_type, "watch event");
                    self.dispatch(&event.into());
                }
                _ = ticker.tick() => {
                    match self.resync() {
                        Ok(count) => debug!(collection, count, "resynced"),
                        Err(e) => warn!(collection, "resync failed: {}", e),
                    }
                }
            }
        }

        info!(collection, "informer stopped");
        Ok(())
    }
}
