//! Worker pool driving a reconciler from its queue

use crate::error::ReconcileResult;
use crate::queue::WorkQueue;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Converges one resource kind towards its declared state
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Run one reconcile cycle for the resource with this ID
    async fn reconcile(&self, id: &str) -> ReconcileResult<()>;
}

/// Process a single key and settle it in the queue
pub async fn process_next<C>(reconciler: &C, queue: &Arc<WorkQueue>) -> bool
where
    C: Reconciler + ?Sized,
{
    let Some(key) = queue.get().await else {
        return false;
    };

    let span = info_span!("reconcile", reconciler = reconciler.name(), id = %key);
    match reconciler.reconcile(&key).instrument(span).await {
        Ok(()) => queue.forget(&key),
        Err(e) if e.is_conflict() => {
            debug!(reconciler = reconciler.name(), id = %key, "conflict, retrying: {}", e);
            queue.add(&key);
        }
        Err(e) => {
            let requeues = queue.num_requeues(&key);
            if e.is_permanent() {
                warn!(reconciler = reconciler.name(), id = %key, requeues, "reconcile rejected: {}", e);
            } else {
                error!(reconciler = reconciler.name(), id = %key, requeues, "reconcile failed: {}", e);
            }
            queue.add_rate_limited(&key);
        }
    }
    queue.done(&key);
    true
}

/// Run `workers` tasks until `shutdown` fires, then shut the queue down
/// and wait for every in-flight cycle to finish.
pub async fn run_workers<C>(
    reconciler: Arc<C>,
    queue: Arc<WorkQueue>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) where
    C: Reconciler + ?Sized,
{
    let name = reconciler.name();
    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        let reconciler = Arc::clone(&reconciler);
        let queue = Arc::clone(&queue);
        tasks.spawn(async move { while process_next(&*reconciler, &queue).await {} });
    }
    info!(reconciler = name, workers, "workers started");

    let _ = shutdown.wait_for(|stopped| *stopped).await;
    queue.shut_down();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(reconciler = name, "worker panicked: {}", e);
        }
    }
    queue.join_delayed().await;
    info!(reconciler = name, "workers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;
    use crate::options::QueueConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use volplane_block::BackendError;

    /// Fails each key a configured number of times, then succeeds
    struct Flaky {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, id: &str) -> ReconcileResult<()> {
            self.calls.lock().push(id.to_string());
            let mut failures = self.failures.lock();
            match failures.get_mut(id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(ReconcileError::backend(
                        "flaky",
                        BackendError::Unavailable("down".to_string()),
                    ))
                }
                _ => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_key_retried_until_success() {
        let reconciler = Flaky {
            failures: Mutex::new(HashMap::from([("a".to_string(), 3)])),
            calls: Mutex::new(Vec::new()),
        };
        let queue = WorkQueue::new("flaky", QueueConfig::default());
        queue.add("a");

        for _ in 0..4 {
            assert!(process_next(&reconciler, &queue).await);
        }
        assert_eq!(reconciler.calls.lock().len(), 4);
        assert_eq!(queue.num_requeues("a"), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_workers_stops_on_signal() {
        let reconciler = Arc::new(Flaky {
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        });
        let queue = WorkQueue::new("flaky", QueueConfig::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let pool = tokio::spawn(run_workers(
            Arc::clone(&reconciler),
            Arc::clone(&queue),
            3,
            stop_rx,
        ));

        for key in ["a", "b", "c", "d"] {
            queue.add(key);
        }
        for _ in 0..200 {
            if reconciler.calls.lock().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        stop_tx.send(true).unwrap();
        pool.await.unwrap();
        assert!(queue.is_shutting_down());

        let mut calls = reconciler.calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec!["a", "b", "c", "d"]);
    }
}
