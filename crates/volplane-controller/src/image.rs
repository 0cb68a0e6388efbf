//! Image reconciler.
//!
//! Drives an image from `Pending` to `Available`:
//!
//! 1. attach the finalizer
//! 2. link a content reference to a digest-keyed snapshot
//! 3. create the device, empty or cloned from a ready snapshot
//! 4. tag it (WWN, QoS limits), write the encryption header, hand out access
//!
//! A clone is never smaller than its source snapshot; a request below the
//! snapshot size is rejected before anything is created. Once available
//! only growth is applied. Deletion waits until the device
//! has no clones and no snapshots left, then removes it.

use crate::error::{BackendContext, ReconcileError, ReconcileResult};
use crate::finalizer::{add_finalizer, delete_ignore_missing, get_optional, strip_finalizer};
use crate::options::ReconcilerOptions;
use crate::snapshot::snapshot_location;
use crate::worker::Reconciler;

use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};
use volplane_block::{
    BackendError, BlockBackend, ContentSource, WWN_METADATA_KEY, image_device,
};
use volplane_common::{
    EncryptionState, EncryptionType, FINALIZER, Image, ImageAccess, ImageState, Snapshot,
    round_size, validate_wwn,
};
use volplane_kms::Kms;
use volplane_meta_store::Store;

pub struct ImageReconciler {
    images: Store<Image>,
    snapshots: Store<Snapshot>,
    backend: Arc<dyn BlockBackend>,
    source: Arc<dyn ContentSource>,
    kms: Arc<Kms>,
    options: Arc<ReconcilerOptions>,
}

impl ImageReconciler {
    pub fn new(
        images: Store<Image>,
        snapshots: Store<Snapshot>,
        backend: Arc<dyn BlockBackend>,
        source: Arc<dyn ContentSource>,
        kms: Arc<Kms>,
        options: Arc<ReconcilerOptions>,
    ) -> ReconcileResult<Self> {
        options.validate()?;
        Ok(Self {
            images,
            snapshots,
            backend,
            source,
            kms,
            options,
        })
    }

    /// Resolve the content reference and point the image at the snapshot
    /// for that content, creating the snapshot if this is the first image
    /// to use it.
    async fn link_snapshot(&self, mut image: Image, reference: String) -> ReconcileResult<()> {
        let digest = self.source.resolve(&reference).await?;
        let candidate = Snapshot::for_content(&reference, &digest);
        let snapshot_id = candidate.metadata.id.clone();

        let snapshot = match self.snapshots.create(candidate) {
            Ok(created) => {
                info!(snapshot = %snapshot_id, %digest, "created content snapshot");
                created
            }
            Err(e) if e.is_already_exists() => self.snapshots.get(&snapshot_id)?,
            Err(e) => return Err(e.into()),
        };
        if snapshot.metadata.is_deleting() {
            return Err(ReconcileError::SnapshotDeleting(snapshot_id));
        }

        debug!(snapshot = %snapshot_id, "linking snapshot");
        image.spec.snapshot_ref = Some(snapshot_id);
        self.images.update(image)?;
        Ok(())
    }

    /// Create the device. Returns its size, or `None` while the source
    /// snapshot is not ready.
    async fn provision(
        &self,
        image: &Image,
        device: &str,
        target: u64,
    ) -> ReconcileResult<Option<u64>> {
        let Some(snapshot_id) = image.spec.snapshot_ref.as_deref() else {
            self.backend
                .create_device(device, target)
                .await
                .context(|| format!("create {device}"))?;
            info!(device, size = target, "created device");
            return Ok(Some(target));
        };

        let snapshot = match get_optional(&self.snapshots, snapshot_id)? {
            Some(s) if s.is_ready() && !s.metadata.is_deleting() => s,
            Some(s) => {
                info!(snapshot = snapshot_id, state = ?s.status.state, "waiting for snapshot");
                return Ok(None);
            }
            None => {
                info!(snapshot = snapshot_id, "waiting for snapshot to appear");
                return Ok(None);
            }
        };

        if snapshot.status.size > target {
            return Err(ReconcileError::ShrinkUnsupported {
                id: image.metadata.id.clone(),
                current: snapshot.status.size,
                requested: target,
            });
        }

        let (parent, snap_name) = snapshot_location(&snapshot);
        self.backend
            .clone_device(&parent, &snap_name, device)
            .await
            .context(|| format!("clone {parent}@{snap_name} to {device}"))?;
        info!(device, parent = %parent, snapshot = %snap_name, "cloned device");

        let cloned = self
            .backend
            .open_device(device)
            .await
            .context(|| format!("open {device}"))?;
        self.fit(image, device, cloned.size, target).await.map(Some)
    }

    /// Bring a device that is not yet published to exactly `target`
    async fn fit(
        &self,
        image: &Image,
        device: &str,
        current: u64,
        target: u64,
    ) -> ReconcileResult<u64> {
        if current > target {
            return Err(ReconcileError::ShrinkUnsupported {
                id: image.metadata.id.clone(),
                current,
                requested: target,
            });
        }
        self.grow(device, current, target).await
    }

    /// Grow a device to at least `target`, returning its final size
    async fn grow(&self, device: &str, current: u64, target: u64) -> ReconcileResult<u64> {
        if current >= target {
            return Ok(current);
        }
        self.backend
            .resize_device(device, target)
            .await
            .context(|| format!("resize {device}"))?;
        info!(device, from = current, to = target, "resized device");
        Ok(target)
    }

    /// Size changes on an available image
    async fn resize(
        &self,
        mut image: Image,
        device: &str,
        current: u64,
        target: u64,
    ) -> ReconcileResult<()> {
        match target.cmp(&current) {
            Ordering::Less => Err(ReconcileError::ShrinkUnsupported {
                id: image.metadata.id,
                current,
                requested: target,
            }),
            Ordering::Equal => {
                if image.status.size != current {
                    image.status.size = current;
                    self.images.update(image)?;
                }
                Ok(())
            }
            Ordering::Greater => {
                let size = self.grow(device, current, target).await?;
                image.status.size = size;
                self.images.update(image)?;
                Ok(())
            }
        }
    }

    /// Tag a freshly provisioned device and mark the image available
    async fn publish(&self, mut image: Image, device: &str, size: u64) -> ReconcileResult<()> {
        self.backend
            .set_metadata(device, WWN_METADATA_KEY, &image.spec.wwn)
            .await
            .context(|| format!("set wwn on {device}"))?;

        if image.spec.encryption.encryption_type == EncryptionType::Encrypted
            && image.status.encryption != EncryptionState::HeaderSet
        {
            let passphrase = self
                .kms
                .decrypt(&image.spec.encryption.encrypted_passphrase)?;
            self.backend
                .format_encrypted(device, &passphrase)
                .await
                .context(|| format!("format {device}"))?;
            image.status.encryption = EncryptionState::HeaderSet;
            image = self.images.update(image)?;
            info!(device, "encryption header set");
        }

        for (key, value) in &image.spec.limits {
            self.backend
                .set_metadata(device, &key.metadata_key(), &value.to_string())
                .await
                .context(|| format!("set {key} on {device}"))?;
        }

        let credentials = self
            .backend
            .fetch_credentials(&self.options.client_name)
            .await
            .context(|| format!("fetch credentials for {}", self.options.client_name))?;

        image.status.access = Some(ImageAccess {
            monitors: self.options.monitors.join(","),
            handle: format!("{}/{device}", self.options.pool),
            user: credentials.user,
            user_key: credentials.key,
        });
        image.status.state = ImageState::Available;
        image.status.size = size;
        self.images.update(image)?;
        info!(device, size, "image available");
        Ok(())
    }

    async fn finalize(&self, image: Image) -> ReconcileResult<()> {
        if !image.metadata.has_finalizer(FINALIZER) {
            return Ok(());
        }
        let device = image_device(&image.metadata.id);

        match self.backend.open_device(&device).await {
            Ok(_) => {
                let children = self
                    .backend
                    .list_children(&device)
                    .await
                    .context(|| format!("list children of {device}"))?;
                if !children.is_empty() {
                    info!(device, children = children.len(), "device still has clones, waiting");
                    return Ok(());
                }
                let snapshots = self
                    .backend
                    .list_snapshots(&device)
                    .await
                    .context(|| format!("list snapshots of {device}"))?;
                if !snapshots.is_empty() {
                    info!(device, snapshots = snapshots.len(), "device still has snapshots, waiting");
                    return Ok(());
                }
                match self.backend.remove_device(&device).await {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(ReconcileError::backend(format!("remove {device}"), e)),
                }
                info!(device, "removed device");
            }
            Err(e) if e.is_not_found() => debug!(device, "device already gone"),
            Err(e) => return Err(ReconcileError::backend(format!("open {device}"), e)),
        }

        if let Some(snapshot_id) = image.spec.snapshot_ref.as_deref() {
            if let Some(snapshot) = get_optional(&self.snapshots, snapshot_id)? {
                if snapshot.is_content() && !snapshot.metadata.is_deleting() {
                    delete_ignore_missing(&self.snapshots, snapshot_id)?;
                    info!(snapshot = snapshot_id, "requested content snapshot deletion");
                }
            }
        }

        strip_finalizer(&self.images, image)
    }
}

#[async_trait]
impl Reconciler for ImageReconciler {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn reconcile(&self, id: &str) -> ReconcileResult<()> {
        let Some(image) = get_optional(&self.images, id)? else {
            debug!("image gone");
            return Ok(());
        };

        if image.metadata.is_deleting() {
            return self.finalize(image).await;
        }
        if !image.metadata.has_finalizer(FINALIZER) {
            return add_finalizer(&self.images, image);
        }
        if image.spec.snapshot_ref.is_none() {
            if let Some(reference) = image.spec.image.clone() {
                return self.link_snapshot(image, reference).await;
            }
        }

        validate_wwn(&image.spec.wwn)?;

        let device = image_device(id);
        let target = round_size(image.spec.size);
        let existing = match self.backend.open_device(&device).await {
            Ok(info) => Some(info),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(ReconcileError::backend(format!("open {device}"), e)),
        };

        let size = match existing {
            Some(info) if image.is_available() => {
                return self.resize(image, &device, info.size, target).await;
            }
            // Left over from an interrupted cycle
            Some(info) => self.fit(&image, &device, info.size, target).await?,
            None => match self.provision(&image, &device, target).await? {
                Some(size) => size,
                None => return Ok(()),
            },
        };
        self.publish(image, &device, size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use volplane_block::{VERSION_TAG, calculate_limits};
    use volplane_common::{ContentDigest, GIB, LimitKey, MIB, SnapshotState};

    async fn converge(h: &Harness, id: &str) {
        let reconciler = h.image_reconciler();
        for _ in 0..5 {
            reconciler.reconcile(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_image_becomes_available() {
        let h = Harness::new();
        let created = h.images.create(Image::new("vol1", GIB)).unwrap();
        assert_eq!(created.status.state, ImageState::Pending);
        assert_eq!(created.spec.wwn.len(), 16);

        converge(&h, "vol1").await;

        let image = h.images.get("vol1").unwrap();
        assert!(image.is_available());
        assert_eq!(image.status.size, GIB);
        assert_eq!(image.status.encryption, EncryptionState::None);
        assert!(image.metadata.has_finalizer(FINALIZER));

        let access = image.status.access.unwrap();
        assert_eq!(access.handle, "rbd/img_vol1");
        assert_eq!(access.user, "volplane");
        assert_eq!(access.monitors, "mon1:6789,mon2:6789");
        assert!(!access.user_key.is_empty());

        assert_eq!(h.backend.open_device("img_vol1").await.unwrap().size, GIB);
        let metadata = h.backend.get_metadata("img_vol1").await.unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get(WWN_METADATA_KEY), Some(&image.spec.wwn));
        assert!(!h.backend.is_encrypted("img_vol1"));
    }

    #[tokio::test]
    async fn test_first_cycle_only_adds_finalizer() {
        let h = Harness::new();
        h.images.create(Image::new("vol1", GIB)).unwrap();
        h.image_reconciler().reconcile("vol1").await.unwrap();

        let image = h.images.get("vol1").unwrap();
        assert!(image.metadata.has_finalizer(FINALIZER));
        assert_eq!(image.status.state, ImageState::Pending);
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_image_is_noop() {
        let h = Harness::new();
        h.image_reconciler().reconcile("nope").await.unwrap();
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_size_rounded_up() {
        let h = Harness::new();
        h.images.create(Image::new("small", 1)).unwrap();
        converge(&h, "small").await;
        assert_eq!(h.images.get("small").unwrap().status.size, MIB);
        assert_eq!(h.backend.open_device("img_small").await.unwrap().size, MIB);
    }

    #[tokio::test]
    async fn test_limits_and_encryption_applied() {
        let h = Harness::new();
        let mut image = Image::new("secure", GIB);
        image.spec.limits = calculate_limits(100, 50, 5, 20);
        image.spec.encryption.encryption_type = EncryptionType::Encrypted;
        image.spec.encryption.encrypted_passphrase = h.kms.encrypt(b"volume secret").unwrap();
        h.images.create(image).unwrap();

        converge(&h, "secure").await;

        let image = h.images.get("secure").unwrap();
        assert!(image.is_available());
        assert_eq!(image.status.encryption, EncryptionState::HeaderSet);
        assert!(h.backend.is_encrypted("img_secure"));

        let metadata = h.backend.get_metadata("img_secure").await.unwrap();
        assert_eq!(metadata.len(), 1 + LimitKey::ALL.len());
        assert_eq!(
            metadata.get("conf_rbd_qos_iops_limit").map(String::as_str),
            Some("100")
        );
        assert_eq!(
            metadata.get("conf_rbd_qos_bps_burst").map(String::as_str),
            Some("250")
        );
    }

    #[tokio::test]
    async fn test_bad_passphrase_keeps_pending() {
        let h = Harness::new();
        let mut image = Image::new("secure", GIB);
        image.spec.encryption.encryption_type = EncryptionType::Encrypted;
        image.spec.encryption.encrypted_passphrase = b"not sealed".to_vec();
        h.images.create(image).unwrap();

        let reconciler = h.image_reconciler();
        reconciler.reconcile("secure").await.unwrap();
        let err = reconciler.reconcile("secure").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Kms(_)));
        assert_eq!(h.images.get("secure").unwrap().status.state, ImageState::Pending);
        assert!(!h.backend.is_encrypted("img_secure"));
    }

    #[tokio::test]
    async fn test_waits_for_snapshot_then_clones() {
        let h = Harness::new();
        h.seed_volume_snapshot("golden", "snap1").await;

        let mut image = Image::new("vol2", GIB);
        image.spec.snapshot_ref = Some("snap1".to_string());
        h.images.create(image).unwrap();

        // Snapshot not ready: no backend change
        h.backend.clear_calls();
        converge(&h, "vol2").await;
        assert!(h.backend.calls().is_empty());
        assert_eq!(h.images.get("vol2").unwrap().status.state, ImageState::Pending);

        let snapshots = h.snapshot_reconciler();
        for _ in 0..3 {
            snapshots.reconcile("snap1").await.unwrap();
        }
        assert_eq!(
            h.snapshots.get("snap1").unwrap().status.state,
            SnapshotState::Ready
        );

        converge(&h, "vol2").await;
        let image = h.images.get("vol2").unwrap();
        assert!(image.is_available());
        let info = h.backend.open_device("img_vol2").await.unwrap();
        assert_eq!(
            info.parent,
            Some(("img_golden".to_string(), "snap1".to_string()))
        );
        assert_eq!(info.size, GIB);
    }

    #[tokio::test]
    async fn test_clone_grown_to_requested_size() {
        let h = Harness::new();
        h.seed_volume_snapshot("golden", "snap1").await;
        let snapshots = h.snapshot_reconciler();
        for _ in 0..3 {
            snapshots.reconcile("snap1").await.unwrap();
        }

        let mut image = Image::new("big", 3 * GIB);
        image.spec.snapshot_ref = Some("snap1".to_string());
        h.images.create(image).unwrap();
        converge(&h, "big").await;

        assert_eq!(h.images.get("big").unwrap().status.size, 3 * GIB);
        assert_eq!(h.backend.open_device("img_big").await.unwrap().size, 3 * GIB);
    }

    #[tokio::test]
    async fn test_clone_smaller_than_snapshot_rejected() {
        let h = Harness::new();
        h.images.create(Image::new("golden", 3 * GIB)).unwrap();
        converge(&h, "golden").await;
        h.snapshots
            .create(Snapshot::for_volume("snap1", "golden"))
            .unwrap();
        let snapshots = h.snapshot_reconciler();
        for _ in 0..3 {
            snapshots.reconcile("snap1").await.unwrap();
        }
        assert_eq!(h.snapshots.get("snap1").unwrap().status.size, 3 * GIB);

        let mut image = Image::new("small", GIB);
        image.spec.snapshot_ref = Some("snap1".to_string());
        h.images.create(image).unwrap();

        let reconciler = h.image_reconciler();
        reconciler.reconcile("small").await.unwrap();
        h.backend.clear_calls();
        for _ in 0..2 {
            let err = reconciler.reconcile("small").await.unwrap_err();
            assert!(err.is_permanent());
            assert!(matches!(
                err,
                ReconcileError::ShrinkUnsupported { current, requested, .. }
                    if current == 3 * GIB && requested == GIB
            ));
        }
        assert!(h.backend.calls().is_empty());
        assert!(!h.backend.contains("img_small"));
        assert_eq!(h.images.get("small").unwrap().status.state, ImageState::Pending);

        // Asking for at least the snapshot size lets it through
        let mut image = h.images.get("small").unwrap();
        image.spec.size = 3 * GIB;
        h.images.update(image).unwrap();
        converge(&h, "small").await;
        let image = h.images.get("small").unwrap();
        assert!(image.is_available());
        assert_eq!(image.status.size, 3 * GIB);
        assert_eq!(h.backend.open_device("img_small").await.unwrap().size, 3 * GIB);
    }

    #[tokio::test]
    async fn test_invalid_wwn_rejected() {
        let h = Harness::new();
        let mut image = Image::new("badwwn", GIB);
        image.spec.wwn = "not-a-wwn".to_string();
        h.images.create(image).unwrap();

        let reconciler = h.image_reconciler();
        reconciler.reconcile("badwwn").await.unwrap();
        let err = reconciler.reconcile("badwwn").await.unwrap_err();
        assert!(err.is_permanent());
        assert!(matches!(err, ReconcileError::Invalid(_)));
        assert!(!h.backend.contains("img_badwwn"));
    }

    #[tokio::test]
    async fn test_expand_then_reject_shrink() {
        let h = Harness::new();
        h.images.create(Image::new("vol3", GIB)).unwrap();
        converge(&h, "vol3").await;

        let mut image = h.images.get("vol3").unwrap();
        image.spec.size = GIB + GIB / 2;
        h.images.update(image).unwrap();
        converge(&h, "vol3").await;
        assert_eq!(h.images.get("vol3").unwrap().status.size, 2 * GIB);
        assert_eq!(h.backend.open_device("img_vol3").await.unwrap().size, 2 * GIB);

        let mut image = h.images.get("vol3").unwrap();
        image.spec.size = GIB;
        h.images.update(image).unwrap();
        h.backend.clear_calls();

        let err = h.image_reconciler().reconcile("vol3").await.unwrap_err();
        assert!(err.is_permanent());
        assert!(matches!(err, ReconcileError::ShrinkUnsupported { .. }));
        assert!(h.backend.calls().is_empty());
        assert_eq!(h.backend.open_device("img_vol3").await.unwrap().size, 2 * GIB);
        assert_eq!(h.images.get("vol3").unwrap().status.size, 2 * GIB);
    }

    #[tokio::test]
    async fn test_content_images_share_snapshot() {
        let h = Harness::new();
        h.write_content("debian.img", b"debian 12 image");
        h.write_content("mirror/debian.img", b"debian 12 image");

        let mut a = Image::new("a", GIB);
        a.spec.image = Some("debian.img".to_string());
        let mut b = Image::new("b", GIB);
        b.spec.image = Some("mirror/debian.img".to_string());
        h.images.create(a).unwrap();
        h.images.create(b).unwrap();

        let reconciler = h.image_reconciler();
        for id in ["a", "b"] {
            reconciler.reconcile(id).await.unwrap();
            reconciler.reconcile(id).await.unwrap();
        }

        let a = h.images.get("a").unwrap();
        let b = h.images.get("b").unwrap();
        assert!(a.spec.snapshot_ref.is_some());
        assert_eq!(a.spec.snapshot_ref, b.spec.snapshot_ref);
        assert_eq!(h.snapshots.list().unwrap().len(), 1);

        let snapshot_id = a.spec.snapshot_ref.unwrap();
        assert!(snapshot_id.starts_with("sha256-"));
        for _ in 0..3 {
            h.snapshot_reconciler().reconcile(&snapshot_id).await.unwrap();
        }
        converge(&h, "a").await;
        converge(&h, "b").await;

        let snap_device = format!("snap_{snapshot_id}");
        let children = h.backend.list_children(&snap_device).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.snapshot == VERSION_TAG));
        assert_eq!(
            &h.backend.read_device("img_a").unwrap()[..15],
            b"debian 12 image"
        );
    }

    #[tokio::test]
    async fn test_link_refuses_deleting_snapshot() {
        let h = Harness::new();
        h.write_content("os.img", b"bytes");
        let digest = ContentDigest::compute(b"bytes");
        let mut snapshot = Snapshot::for_content("os.img", &digest);
        snapshot.metadata.finalizers.push(FINALIZER.to_string());
        h.snapshots.create(snapshot).unwrap();
        h.snapshots.delete(&digest.snapshot_id()).unwrap();

        let mut image = Image::new("late", GIB);
        image.spec.image = Some("os.img".to_string());
        h.images.create(image).unwrap();

        let reconciler = h.image_reconciler();
        reconciler.reconcile("late").await.unwrap();
        let err = reconciler.reconcile("late").await.unwrap_err();
        assert!(matches!(err, ReconcileError::SnapshotDeleting(_)));
        assert_eq!(h.images.get("late").unwrap().spec.snapshot_ref, None);
    }

    #[tokio::test]
    async fn test_delete_removes_device_and_object() {
        let h = Harness::new();
        h.images.create(Image::new("vol4", GIB)).unwrap();
        converge(&h, "vol4").await;

        h.images.delete("vol4").unwrap();
        assert!(h.images.get("vol4").unwrap().metadata.is_deleting());

        h.image_reconciler().reconcile("vol4").await.unwrap();
        assert!(h.images.get("vol4").unwrap_err().is_not_found());
        assert!(!h.backend.contains("img_vol4"));
    }

    #[tokio::test]
    async fn test_delete_without_device() {
        let h = Harness::new();
        h.images.create(Image::new("vol5", GIB)).unwrap();
        let reconciler = h.image_reconciler();
        reconciler.reconcile("vol5").await.unwrap();

        h.images.delete("vol5").unwrap();
        reconciler.reconcile("vol5").await.unwrap();
        assert!(h.images.get("vol5").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_waits_for_clones() {
        let h = Harness::new();
        h.seed_volume_snapshot("golden", "snap1").await;
        let snapshots = h.snapshot_reconciler();
        for _ in 0..3 {
            snapshots.reconcile("snap1").await.unwrap();
        }
        let mut clone = Image::new("child", GIB);
        clone.spec.snapshot_ref = Some("snap1".to_string());
        h.images.create(clone).unwrap();
        converge(&h, "child").await;

        h.images.delete("golden").unwrap();
        h.backend.clear_calls();
        let reconciler = h.image_reconciler();
        reconciler.reconcile("golden").await.unwrap();

        let golden = h.images.get("golden").unwrap();
        assert!(golden.metadata.has_finalizer(FINALIZER));
        assert!(h.backend.contains("img_golden"));
        assert!(h.backend.calls().is_empty());

        // Tear down the clone, then the snapshot, then the source
        h.images.delete("child").unwrap();
        reconciler.reconcile("child").await.unwrap();
        h.snapshots.delete("snap1").unwrap();
        snapshots.reconcile("snap1").await.unwrap();
        reconciler.reconcile("golden").await.unwrap();

        assert!(h.images.get("golden").unwrap_err().is_not_found());
        assert!(h.backend.device_names().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_content_snapshot() {
        let h = Harness::new();
        h.write_content("os.img", b"bytes");
        let mut image = Image::new("vol6", GIB);
        image.spec.image = Some("os.img".to_string());
        h.images.create(image).unwrap();

        let reconciler = h.image_reconciler();
        reconciler.reconcile("vol6").await.unwrap();
        reconciler.reconcile("vol6").await.unwrap();
        let snapshot_id = h.images.get("vol6").unwrap().spec.snapshot_ref.unwrap();
        let snapshots = h.snapshot_reconciler();
        for _ in 0..3 {
            snapshots.reconcile(&snapshot_id).await.unwrap();
        }
        converge(&h, "vol6").await;

        h.images.delete("vol6").unwrap();
        reconciler.reconcile("vol6").await.unwrap();
        assert!(h.images.get("vol6").unwrap_err().is_not_found());
        assert!(h.snapshots.get(&snapshot_id).unwrap().metadata.is_deleting());

        snapshots.reconcile(&snapshot_id).await.unwrap();
        assert!(h.snapshots.get(&snapshot_id).unwrap_err().is_not_found());
        assert!(h.backend.device_names().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_leaves_state() {
        let h = Harness::new();
        h.images.create(Image::new("vol7", GIB)).unwrap();
        let reconciler = h.image_reconciler();
        reconciler.reconcile("vol7").await.unwrap();

        h.backend.fail_next("create_device", 1);
        let err = reconciler.reconcile("vol7").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Backend { .. }));
        assert_eq!(h.images.get("vol7").unwrap().status.state, ImageState::Pending);

        reconciler.reconcile("vol7").await.unwrap();
        assert!(h.images.get("vol7").unwrap().is_available());
    }

    #[tokio::test]
    async fn test_interrupted_publish_resumes() {
        let h = Harness::new();
        h.images.create(Image::new("vol8", GIB)).unwrap();
        let reconciler = h.image_reconciler();
        reconciler.reconcile("vol8").await.unwrap();

        h.backend.fail_next("fetch_credentials", 1);
        assert!(reconciler.reconcile("vol8").await.is_err());
        assert!(h.backend.contains("img_vol8"));

        reconciler.reconcile("vol8").await.unwrap();
        let image = h.images.get("vol8").unwrap();
        assert!(image.is_available());
        assert_eq!(image.status.size, GIB);
    }

    #[test]
    fn test_requires_options() {
        let h = Harness::new();
        let result = ImageReconciler::new(
            h.images.clone(),
            h.snapshots.clone(),
            h.backend.clone(),
            h.source.clone(),
            Arc::clone(&h.kms),
            Arc::new(ReconcilerOptions::new("", "volplane")),
        );
        assert!(matches!(result, Err(ReconcileError::MissingDependency(_))));
    }
}
