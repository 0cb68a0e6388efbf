//! Best-effort change notification.
//!
//! Publishing never blocks: every subscriber owns a bounded channel and an
//! event that does not fit is dropped for that subscriber. Consumers must
//! pair a subscription with a periodic full list to recover missed events.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Kind of mutation observed by the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Created,
    Updated,
    /// Either a hard delete or a delete request on an object with finalizers
    Deleted,
}

/// A single store mutation
#[derive(Clone, Debug)]
pub struct WatchEvent<R> {
    pub event_type: EventType,
    pub object: R,
}

/// Subscriber set of one collection
pub(crate) struct Watchers<R> {
    collection: &'static str,
    buffer: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<WatchEvent<R>>>>,
}

impl<R: Clone + Send + 'static> Watchers<R> {
    pub(crate) fn new(collection: &'static str, buffer: usize) -> Self {
        Self {
            collection,
            buffer: buffer.max(1),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription<R> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, tx);
        debug!(collection = self.collection, subscriber = id, "watch subscribed");
        Subscription {
            id,
            rx,
            watchers: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
        debug!(collection = self.collection, subscriber = id, "watch unsubscribed");
    }

    /// Deliver an event to every subscriber that has room for it
    pub(crate) fn publish(&self, event_type: EventType, object: &R) {
        let subscribers = self.subscribers.read();
        for (id, tx) in subscribers.iter() {
            let event = WatchEvent {
                event_type,
                object: object.clone(),
            };
            match tx.try_send(event) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        collection = self.collection,
                        subscriber = id,
                        ?event_type,
                        "watch event dropped, subscriber not ready"
                    );
                }
            }
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Handle to a live watch. Dropping it unsubscribes.
pub struct Subscription<R: Clone + Send + 'static> {
    id: u64,
    rx: mpsc::Receiver<WatchEvent<R>>,
    watchers: Arc<Watchers<R>>,
}

impl<R: Clone + Send + 'static> Subscription<R> {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<WatchEvent<R>> {
        self.rx.recv().await
    }

    /// Take the next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<WatchEvent<R>> {
        self.rx.try_recv().ok()
    }
}

impl<R: Clone + Send + 'static> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.watchers.unsubscribe(self.id);
    }
}
