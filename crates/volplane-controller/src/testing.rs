//! Shared fixture for reconciler tests

use crate::image::ImageReconciler;
use crate::options::ReconcilerOptions;
use crate::os_snapshot::OsSnapshotReconciler;
use crate::snapshot::SnapshotReconciler;
use crate::worker::Reconciler;

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use volplane_block::{LocalContentSource, MemoryBackend};
use volplane_common::{GIB, Image, OsSnapshot, Snapshot};
use volplane_kms::Kms;
use volplane_meta_store::{MetaStore, Store};

pub(crate) struct Harness {
    pub store: MetaStore,
    pub images: Store<Image>,
    pub snapshots: Store<Snapshot>,
    pub os_snapshots: Store<OsSnapshot>,
    pub backend: Arc<MemoryBackend>,
    pub source: Arc<LocalContentSource>,
    pub kms: Arc<Kms>,
    pub options: Arc<ReconcilerOptions>,
    content_dir: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        let content_dir = dir.path().join("content");
        std::fs::create_dir_all(&content_dir).unwrap();

        let options = ReconcilerOptions {
            monitors: vec!["mon1:6789".to_string(), "mon2:6789".to_string()],
            copy_buffer_size: 4096,
            ..ReconcilerOptions::new("rbd", "volplane")
        };

        Self {
            images: store.collection().unwrap(),
            snapshots: store.collection().unwrap(),
            os_snapshots: store.collection().unwrap(),
            store,
            backend: Arc::new(MemoryBackend::new()),
            source: Arc::new(LocalContentSource::new(&content_dir)),
            kms: Arc::new(Kms::new(&Kms::generate_key()).unwrap()),
            options: Arc::new(options),
            content_dir,
            _dir: dir,
        }
    }

    pub fn image_reconciler(&self) -> ImageReconciler {
        ImageReconciler::new(
            self.images.clone(),
            self.snapshots.clone(),
            self.backend.clone(),
            self.source.clone(),
            Arc::clone(&self.kms),
            Arc::clone(&self.options),
        )
        .unwrap()
    }

    pub fn snapshot_reconciler(&self) -> SnapshotReconciler {
        SnapshotReconciler::new(
            self.snapshots.clone(),
            self.images.clone(),
            self.backend.clone(),
            self.source.clone(),
            Arc::clone(&self.options),
        )
        .unwrap()
    }

    pub fn os_snapshot_reconciler(&self) -> OsSnapshotReconciler {
        OsSnapshotReconciler::new(
            self.os_snapshots.clone(),
            self.backend.clone(),
            self.source.clone(),
            Arc::clone(&self.options),
        )
        .unwrap()
    }

    /// Write a file under the content source root
    pub fn write_content(&self, reference: &str, data: &[u8]) {
        let path = self.content_dir.join(reference);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    /// Bring a 1 GiB image to `Available` and request a snapshot of it.
    /// The snapshot is left `Pending` without a finalizer.
    pub async fn seed_volume_snapshot(&self, image_id: &str, snapshot_id: &str) {
        self.images.create(Image::new(image_id, GIB)).unwrap();
        let reconciler = self.image_reconciler();
        for _ in 0..3 {
            reconciler.reconcile(image_id).await.unwrap();
        }
        assert!(self.images.get(image_id).unwrap().is_available());

        self.snapshots
            .create(Snapshot::for_volume(snapshot_id, image_id))
            .unwrap();
    }
}
