//! Rate-limited work queue.
//!
//! Keys are resource IDs. A key is held at most once in the queue and is
//! handed to at most one worker at a time: adding a key that is being
//! processed marks it dirty, and it is queued again when the worker calls
//! [`WorkQueue::done`].
//!
//! Failed keys are re-added after `base_delay * 2^failures`, capped at
//! `max_delay`. Delayed re-adds run as tasks owned by the queue and are
//! cancelled on shutdown.

use crate::options::QueueConfig;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or not
    dirty: HashSet<String>,
    /// Keys handed to a worker and not yet done
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue with per-key exponential backoff
pub struct WorkQueue {
    name: &'static str,
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    stop_tx: watch::Sender<bool>,
    delayed: Mutex<JoinSet<()>>,
}

impl WorkQueue {
    #[must_use]
    pub fn new(name: &'static str, config: QueueConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            name,
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            stop_tx,
            delayed: Mutex::new(JoinSet::new()),
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a key for processing
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key as processed, queueing it again if it was re-added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear the failure count of a key
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Number of failures recorded for a key since it was last forgotten
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Re-add a key after its backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = self.backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        debug!(queue = self.name, key, ?delay, "requeue with backoff");

        let queue = Arc::clone(self);
        let key = key.to_string();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut delayed = self.delayed.lock();
        while delayed.try_join_next().is_some() {}
        delayed.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(&key),
                _ = stop_rx.wait_for(|stopped| *stopped) => {}
            }
        });
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    /// Stop accepting keys. Workers drain what is queued, then `get`
    /// returns `None`.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.stop_tx.send_replace(true);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Wait for all delayed re-adds to finish. Call after [`Self::shut_down`].
    pub async fn join_delayed(&self) {
        let mut delayed = std::mem::take(&mut *self.delayed.lock());
        while let Some(result) = delayed.join_next().await {
            if let Err(e) = result {
                warn!(queue = self.name, "delayed requeue task failed: {}", e);
            }
        }
    }

    /// Keys waiting in the queue
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
