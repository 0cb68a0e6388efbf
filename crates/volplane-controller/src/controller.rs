//! Wiring of informers, queues and worker pools.
//!
//! Each resource kind gets an informer feeding its own queue. Handlers also
//! enqueue dependents: an image waiting for a snapshot, a snapshot waiting
//! for its source image, and devices waiting for clones to go away.

use crate::error::{ReconcileError, ReconcileResult};
use crate::image::ImageReconciler;
use crate::informer::{Informer, ResourceEvent};
use crate::options::ReconcilerOptions;
use crate::os_snapshot::OsSnapshotReconciler;
use crate::queue::WorkQueue;
use crate::snapshot::SnapshotReconciler;
use crate::worker::run_workers;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use volplane_block::{BlockBackend, ContentSource};
use volplane_common::{Image, OsSnapshot, Resource, Snapshot, SnapshotSource};
use volplane_kms::Kms;
use volplane_meta_store::{MetaStore, Store};

/// Runs the image, snapshot and OS snapshot reconcilers of one process
pub struct Controller {
    options: Arc<ReconcilerOptions>,
    image_informer: Arc<Informer<Image>>,
    snapshot_informer: Arc<Informer<Snapshot>>,
    os_snapshot_informer: Arc<Informer<OsSnapshot>>,
    image_queue: Arc<WorkQueue>,
    snapshot_queue: Arc<WorkQueue>,
    os_snapshot_queue: Arc<WorkQueue>,
    images: Arc<ImageReconciler>,
    snapshots: Arc<SnapshotReconciler>,
    os_snapshots: Arc<OsSnapshotReconciler>,
}

impl Controller {
    pub fn new(
        store: &MetaStore,
        backend: Arc<dyn BlockBackend>,
        source: Arc<dyn ContentSource>,
        kms: Arc<Kms>,
        options: ReconcilerOptions,
    ) -> ReconcileResult<Self> {
        options.validate()?;
        let options = Arc::new(options);

        let image_store: Store<Image> = store.collection()?;
        let snapshot_store: Store<Snapshot> = store.collection()?;
        let os_snapshot_store: Store<OsSnapshot> = store.collection()?;

        let images = Arc::new(ImageReconciler::new(
            image_store.clone(),
            snapshot_store.clone(),
            Arc::clone(&backend),
            Arc::clone(&source),
            kms,
            Arc::clone(&options),
        )?);
        let snapshots = Arc::new(SnapshotReconciler::new(
            snapshot_store.clone(),
            image_store.clone(),
            Arc::clone(&backend),
            Arc::clone(&source),
            Arc::clone(&options),
        )?);
        let os_snapshots = Arc::new(OsSnapshotReconciler::new(
            os_snapshot_store.clone(),
            backend,
            source,
            Arc::clone(&options),
        )?);

        let image_queue = WorkQueue::new("image", options.queue.clone());
        let snapshot_queue = WorkQueue::new("snapshot", options.queue.clone());
        let os_snapshot_queue = WorkQueue::new("os-snapshot", options.queue.clone());

        let image_informer = Arc::new(Informer::new(image_store.clone(), options.resync_interval));
        let snapshot_informer = Arc::new(Informer::new(snapshot_store.clone(), options.resync_interval));
        let os_snapshot_informer = Arc::new(Informer::new(os_snapshot_store, options.resync_interval));

        {
            let image_queue = Arc::clone(&image_queue);
            let snapshot_queue = Arc::clone(&snapshot_queue);
            image_informer.add_handler(move |event| {
                on_image_event(event, &image_queue, &snapshot_queue, &snapshot_store);
            });
        }
        {
            let image_queue = Arc::clone(&image_queue);
            let snapshot_queue = Arc::clone(&snapshot_queue);
            snapshot_informer.add_handler(move |event| {
                on_snapshot_event(event, &snapshot_queue, &image_queue, &image_store);
            });
        }
        {
            let os_snapshot_queue = Arc::clone(&os_snapshot_queue);
            os_snapshot_informer.add_handler(move |event| {
                os_snapshot_queue.add(event.object().id());
            });
        }

        Ok(Self {
            options,
            image_informer,
            snapshot_informer,
            os_snapshot_informer,
            image_queue,
            snapshot_queue,
            os_snapshot_queue,
            images,
            snapshots,
            os_snapshots,
        })
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    ///
    /// Returns once every informer and worker has exited. If any of them
    /// fails the rest are stopped and the first error is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ReconcileResult<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let workers = self.options.workers;
        let mut tasks: JoinSet<ReconcileResult<()>> = JoinSet::new();

        let informer = Arc::clone(&self.image_informer);
        let rx = stop_rx.clone();
        tasks.spawn(async move { informer.start(rx).await.map_err(ReconcileError::from) });
        let informer = Arc::clone(&self.snapshot_informer);
        let rx = stop_rx.clone();
        tasks.spawn(async move { informer.start(rx).await.map_err(ReconcileError::from) });
        let informer = Arc::clone(&self.os_snapshot_informer);
        let rx = stop_rx.clone();
        tasks.spawn(async move { informer.start(rx).await.map_err(ReconcileError::from) });

        let pool = run_workers(
            Arc::clone(&self.images),
            Arc::clone(&self.image_queue),
            workers,
            stop_rx.clone(),
        );
        tasks.spawn(async move {
            pool.await;
            Ok(())
        });
        let pool = run_workers(
            Arc::clone(&self.snapshots),
            Arc::clone(&self.snapshot_queue),
            workers,
            stop_rx.clone(),
        );
        tasks.spawn(async move {
            pool.await;
            Ok(())
        });
        let pool = run_workers(
            Arc::clone(&self.os_snapshots),
            Arc::clone(&self.os_snapshot_queue),
            workers,
            stop_rx,
        );
        tasks.spawn(async move {
            pool.await;
            Ok(())
        });

        info!(workers, "controller started");

        let mut first_error = None;
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped), if !*stop_tx.borrow() => {
                    info!("shutting down controller");
                    stop_tx.send_replace(true);
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    if let Err(e) = joined.map_err(ReconcileError::from).and_then(|result| result) {
                        error!("controller task failed: {}", e);
                        stop_tx.send_replace(true);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        info!("controller stopped");
        first_error.map_or(Ok(()), Err)
    }
}

fn on_image_event(
    event: &ResourceEvent<Image>,
    image_queue: &WorkQueue,
    snapshot_queue: &WorkQueue,
    snapshots: &Store<Snapshot>,
) {
    let image = event.object();
    image_queue.add(image.id());

    // A deleted clone may unblock the deletion of the snapshot it came from
    if let Some(snapshot_ref) = &image.spec.snapshot_ref {
        snapshot_queue.add(snapshot_ref);
    }

    // Volume snapshots wait for their source image to become available.
    // Resyncs already cover every snapshot.
    if matches!(event, ResourceEvent::Exists(_)) || !image.is_available() {
        return;
    }
    match snapshots.list() {
        Ok(snapshots) => {
            for snapshot in snapshots {
                if matches!(&snapshot.spec.source, SnapshotSource::VolumeImage { image_id } if image_id == image.id())
                    && !snapshot.is_ready()
                {
                    snapshot_queue.add(snapshot.id());
                }
            }
        }
        Err(e) => warn!(image = %image.id(), "failed to list snapshots: {}", e),
    }
}

fn on_snapshot_event(
    event: &ResourceEvent<Snapshot>,
    snapshot_queue: &WorkQueue,
    image_queue: &WorkQueue,
    images: &Store<Image>,
) {
    let snapshot = event.object();
    snapshot_queue.add(snapshot.id());
    if matches!(event, ResourceEvent::Exists(_)) {
        return;
    }

    // A removed volume snapshot may unblock the deletion of its image
    if let (ResourceEvent::Deleted(_), SnapshotSource::VolumeImage { image_id }) =
        (event, &snapshot.spec.source)
    {
        image_queue.add(image_id);
    }

    if !snapshot.is_ready() {
        return;
    }
    match images.list() {
        Ok(images) => {
            for image in images {
                if image.spec.snapshot_ref.as_deref() == Some(snapshot.id()) && !image.is_available()
                {
                    image_queue.add(image.id());
                }
            }
        }
        Err(e) => warn!(snapshot = %snapshot.id(), "failed to list images: {}", e),
    }
}
