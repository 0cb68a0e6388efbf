//! OS snapshot reconciler.
//!
//! Populates an `os_<id>` device from an external OS image, snapshots it as
//! `v1` and protects the snapshot so it can be cloned from.

use crate::error::{BackendContext, ReconcileError, ReconcileResult};
use crate::finalizer::{add_finalizer, get_optional, strip_finalizer};
use crate::options::ReconcilerOptions;
use crate::populate::populate_snapshot;
use crate::worker::Reconciler;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use volplane_block::{BackendError, BlockBackend, ContentSource, VERSION_TAG, os_snapshot_device};
use volplane_common::{FINALIZER, OsSnapshot, OsSnapshotState};
use volplane_meta_store::Store;

pub struct OsSnapshotReconciler {
    os_snapshots: Store<OsSnapshot>,
    backend: Arc<dyn BlockBackend>,
    source: Arc<dyn ContentSource>,
    options: Arc<ReconcilerOptions>,
}

impl OsSnapshotReconciler {
    pub fn new(
        os_snapshots: Store<OsSnapshot>,
        backend: Arc<dyn BlockBackend>,
        source: Arc<dyn ContentSource>,
        options: Arc<ReconcilerOptions>,
    ) -> ReconcileResult<Self> {
        options.validate()?;
        Ok(Self {
            os_snapshots,
            backend,
            source,
            options,
        })
    }

    async fn finalize(&self, os_snapshot: OsSnapshot) -> ReconcileResult<()> {
        if !os_snapshot.metadata.has_finalizer(FINALIZER) {
            return Ok(());
        }
        let device = os_snapshot_device(&os_snapshot.metadata.id);

        match self.backend.open_device(&device).await {
            Ok(_) => {
                let children = self
                    .backend
                    .list_children(&device)
                    .await
                    .context(|| format!("list children of {device}"))?;
                if !children.is_empty() {
                    info!(device = %device, clones = children.len(), "device still has clones, waiting");
                    return Ok(());
                }

                let snapshots = self
                    .backend
                    .list_snapshots(&device)
                    .await
                    .context(|| format!("list snapshots of {device}"))?;
                for snapshot in snapshots {
                    if snapshot.protected {
                        self.backend
                            .unprotect_snapshot(&device, &snapshot.name)
                            .await
                            .context(|| format!("unprotect {device}@{}", snapshot.name))?;
                    }
                    match self.backend.remove_snapshot(&device, &snapshot.name).await {
                        Ok(()) | Err(BackendError::NotFound(_)) => {}
                        Err(e) => {
                            return Err(ReconcileError::backend(
                                format!("remove {device}@{}", snapshot.name),
                                e,
                            ));
                        }
                    }
                }

                match self.backend.remove_device(&device).await {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(ReconcileError::backend(format!("remove {device}"), e)),
                }
                info!(device = %device, "removed OS snapshot device");
            }
            Err(e) if e.is_not_found() => debug!(device = %device, "device already gone"),
            Err(e) => return Err(ReconcileError::backend(format!("open {device}"), e)),
        }

        strip_finalizer(&self.os_snapshots, os_snapshot)
    }
}

#[async_trait]
impl Reconciler for OsSnapshotReconciler {
    fn name(&self) -> &'static str {
        "os-snapshot"
    }

    async fn reconcile(&self, id: &str) -> ReconcileResult<()> {
        let Some(mut os_snapshot) = get_optional(&self.os_snapshots, id)? else {
            debug!("OS snapshot gone");
            return Ok(());
        };

        if os_snapshot.metadata.is_deleting() {
            return self.finalize(os_snapshot).await;
        }
        if !os_snapshot.metadata.has_finalizer(FINALIZER) {
            return add_finalizer(&self.os_snapshots, os_snapshot);
        }
        if os_snapshot.status.state == OsSnapshotState::Populated {
            return Ok(());
        }

        let device = os_snapshot_device(id);
        let digest = populate_snapshot(
            self.backend.as_ref(),
            self.source.as_ref(),
            &self.options,
            &os_snapshot.spec.reference,
            &device,
            None,
        )
        .await?;

        self.backend
            .protect_snapshot(&device, VERSION_TAG)
            .await
            .context(|| format!("protect {device}@{VERSION_TAG}"))?;

        os_snapshot.status.digest = Some(digest.to_string());
        os_snapshot.status.state = OsSnapshotState::Populated;
        self.os_snapshots.update(os_snapshot)?;
        info!(%digest, "OS snapshot populated");
        Ok(())
    }
}
