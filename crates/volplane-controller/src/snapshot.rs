//! Snapshot reconciler.
//!
//! Volume snapshots live on their source image's device under the
//! snapshot's own ID. Content snapshots own a `snap_<id>` device that is
//! populated from the content source and snapshotted as `v1`.

use crate::error::{BackendContext, ReconcileError, ReconcileResult};
use crate::finalizer::{add_finalizer, get_optional, strip_finalizer};
use crate::options::ReconcilerOptions;
use crate::populate::populate_snapshot;
use crate::worker::Reconciler;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use volplane_block::{
    BackendError, BlockBackend, ContentSource, VERSION_TAG, image_device, snapshot_device,
};
use volplane_common::{
    ContentDigest, FINALIZER, Image, ProtectionPolicy, Snapshot, SnapshotSource, SnapshotState,
    round_size,
};
use volplane_meta_store::Store;

/// Device and snapshot name backing a snapshot resource
#[must_use]
pub fn snapshot_location(snapshot: &Snapshot) -> (String, String) {
    match &snapshot.spec.source {
        SnapshotSource::Content { .. } => {
            (snapshot_device(&snapshot.metadata.id), VERSION_TAG.to_string())
        }
        SnapshotSource::VolumeImage { image_id } => {
            (image_device(image_id), snapshot.metadata.id.clone())
        }
    }
}

pub struct SnapshotReconciler {
    snapshots: Store<Snapshot>,
    images: Store<Image>,
    backend: Arc<dyn BlockBackend>,
    source: Arc<dyn ContentSource>,
    options: Arc<ReconcilerOptions>,
}

impl SnapshotReconciler {
    pub fn new(
        snapshots: Store<Snapshot>,
        images: Store<Image>,
        backend: Arc<dyn BlockBackend>,
        source: Arc<dyn ContentSource>,
        options: Arc<ReconcilerOptions>,
    ) -> ReconcileResult<Self> {
        options.validate()?;
        Ok(Self {
            snapshots,
            images,
            backend,
            source,
            options,
        })
    }

    /// Take the backend snapshot and apply protection. Returns the rounded
    /// size, or `None` while the source image is not available yet.
    async fn take(&self, snapshot: &Snapshot) -> ReconcileResult<Option<u64>> {
        let (device, name) = snapshot_location(snapshot);

        match &snapshot.spec.source {
            SnapshotSource::VolumeImage { image_id } => {
                let image = self.images.get(image_id)?;
                if !image.is_available() {
                    info!(image = %image_id, "waiting for source image");
                    return Ok(None);
                }
            }
            SnapshotSource::Content { reference, digest } => {
                let digest = ContentDigest::parse(digest.as_str())?;
                populate_snapshot(
                    self.backend.as_ref(),
                    self.source.as_ref(),
                    &self.options,
                    reference,
                    &device,
                    Some(&digest),
                )
                .await?;
            }
        }

        let info = self
            .backend
            .open_device(&device)
            .await
            .context(|| format!("open {device}"))?;

        match self.backend.create_snapshot(&device, &name).await {
            Ok(()) => info!(device = %device, snapshot = %name, "created snapshot"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => {
                return Err(ReconcileError::backend(
                    format!("snapshot {device}@{name}"),
                    e,
                ));
            }
        }

        match snapshot.spec.protection {
            ProtectionPolicy::Protected => self
                .backend
                .protect_snapshot(&device, &name)
                .await
                .context(|| format!("protect {device}@{name}"))?,
            ProtectionPolicy::None => self
                .backend
                .unprotect_snapshot(&device, &name)
                .await
                .context(|| format!("unprotect {device}@{name}"))?,
        }

        Ok(Some(round_size(info.size)))
    }

    async fn finalize(&self, snapshot: Snapshot) -> ReconcileResult<()> {
        if !snapshot.metadata.has_finalizer(FINALIZER) {
            return Ok(());
        }
        let (device, name) = snapshot_location(&snapshot);

        match self.backend.open_device(&device).await {
            Ok(_) => {
                let children = self
                    .backend
                    .list_children(&device)
                    .await
                    .context(|| format!("list children of {device}"))?;
                let clones = children.iter().filter(|c| c.snapshot == name).count();
                if clones > 0 {
                    info!(device = %device, snapshot = %name, clones, "snapshot still has clones, waiting");
                    return Ok(());
                }

                let present = self
                    .backend
                    .list_snapshots(&device)
                    .await
                    .context(|| format!("list snapshots of {device}"))?
                    .iter()
                    .any(|s| s.name == name);
                if present {
                    self.backend
                        .unprotect_snapshot(&device, &name)
                        .await
                        .context(|| format!("unprotect {device}@{name}"))?;
                    match self.backend.remove_snapshot(&device, &name).await {
                        Ok(()) | Err(BackendError::NotFound(_)) => {}
                        Err(e) => {
                            return Err(ReconcileError::backend(
                                format!("remove {device}@{name}"),
                                e,
                            ));
                        }
                    }
                    info!(device = %device, snapshot = %name, "removed snapshot");
                }

                if snapshot.is_content() {
                    match self.backend.remove_device(&device).await {
                        Ok(()) | Err(BackendError::NotFound(_)) => {}
                        Err(e) => {
                            return Err(ReconcileError::backend(format!("remove {device}"), e));
                        }
                    }
                    info!(device = %device, "removed device");
                }
            }
            Err(e) if e.is_not_found() => debug!(device = %device, "device already gone"),
            Err(e) => return Err(ReconcileError::backend(format!("open {device}"), e)),
        }

        strip_finalizer(&self.snapshots, snapshot)
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn reconcile(&self, id: &str) -> ReconcileResult<()> {
        let Some(mut snapshot) = get_optional(&self.snapshots, id)? else {
            debug!("snapshot gone");
            return Ok(());
        };

        if snapshot.metadata.is_deleting() {
            return self.finalize(snapshot).await;
        }
        if !snapshot.metadata.has_finalizer(FINALIZER) {
            return add_finalizer(&self.snapshots, snapshot);
        }
        if snapshot.is_ready() {
            return Ok(());
        }

        match self.take(&snapshot).await {
            Ok(Some(size)) => {
                snapshot.status.state = SnapshotState::Ready;
                snapshot.status.size = size;
                self.snapshots.update(snapshot)?;
                info!(size, "snapshot ready");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if snapshot.status.state != SnapshotState::Failed {
                    snapshot.status.state = SnapshotState::Failed;
                    if let Err(store_err) = self.snapshots.update(snapshot) {
                        warn!("failed to record snapshot failure: {}", store_err);
                    }
                }
                Err(e)
            }
        }
    }
}
