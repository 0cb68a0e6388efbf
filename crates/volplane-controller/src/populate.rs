//! Streaming external content into a device.
//!
//! Shared by content snapshots and OS snapshots. A device counts as
//! populated once it carries the `v1` snapshot; a device without it is
//! (re)written from offset zero, so an interrupted copy is simply redone.
//! The digest of the copied bytes is tagged on the device before the
//! snapshot is taken, so a populated device reports what it holds even
//! after the source changes.

use crate::error::{BackendContext, ReconcileError, ReconcileResult};
use crate::options::ReconcilerOptions;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use volplane_block::{
    BlockBackend, ContentSource, DIGEST_METADATA_KEY, SourceError, VERSION_TAG,
};
use volplane_common::{ContentDigest, DigestCalculator, MIB, round_size};

/// Make sure `device` holds the content of `reference` under the `v1`
/// snapshot and return the content digest.
///
/// With `expected` set the streamed bytes must hash to that digest.
pub(crate) async fn populate_snapshot(
    backend: &dyn BlockBackend,
    source: &dyn ContentSource,
    options: &ReconcilerOptions,
    reference: &str,
    device: &str,
    expected: Option<&ContentDigest>,
) -> ReconcileResult<ContentDigest> {
    let existing = match backend.open_device(device).await {
        Ok(info) => Some(info),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(ReconcileError::backend(format!("open {device}"), e)),
    };

    if existing.is_some() {
        let snapshots = backend
            .list_snapshots(device)
            .await
            .context(|| format!("list snapshots of {device}"))?;
        if snapshots.iter().any(|s| s.name == VERSION_TAG) {
            debug!(device, "already populated");
            return populated_digest(backend, source, reference, device, expected).await;
        }
    }

    let mut stream = source.open(reference).await?;
    if let Some(expected) = expected {
        check_digest(reference, expected, &stream.digest)?;
    }

    let size = round_size(stream.size.max(1));
    match existing {
        None => backend
            .create_device(device, size)
            .await
            .context(|| format!("create {device}"))?,
        Some(info) if info.size < size => backend
            .resize_device(device, size)
            .await
            .context(|| format!("resize {device}"))?,
        Some(_) => {}
    }
    info!(device, reference, content_size = stream.size, "populating device");

    let (copied, digest) = copy_into_device(backend, device, &mut stream.reader, options).await?;
    if copied != stream.size {
        return Err(SourceError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("{reference}: expected {} bytes, read {copied}", stream.size),
        ))
        .into());
    }
    check_digest(reference, &stream.digest, &digest)?;

    backend
        .set_metadata(device, DIGEST_METADATA_KEY, &digest.to_string())
        .await
        .context(|| format!("tag digest on {device}"))?;
    match backend.create_snapshot(device, VERSION_TAG).await {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(ReconcileError::backend(format!("snapshot {device}"), e)),
    }
    info!(device, %digest, "device populated");
    Ok(digest)
}

/// Digest of an already populated device, read from its tag. Devices
/// populated without the tag fall back to the expected or current digest.
async fn populated_digest(
    backend: &dyn BlockBackend,
    source: &dyn ContentSource,
    reference: &str,
    device: &str,
    expected: Option<&ContentDigest>,
) -> ReconcileResult<ContentDigest> {
    let metadata = backend
        .get_metadata(device)
        .await
        .context(|| format!("read metadata of {device}"))?;
    let Some(tag) = metadata.get(DIGEST_METADATA_KEY) else {
        warn!(device, "populated device has no digest tag");
        return match expected {
            Some(digest) => Ok(digest.clone()),
            None => Ok(source.resolve(reference).await?),
        };
    };
    let digest = ContentDigest::parse(tag.as_str())?;
    if let Some(expected) = expected {
        check_digest(reference, expected, &digest)?;
    }
    Ok(digest)
}

fn check_digest(
    reference: &str,
    expected: &ContentDigest,
    found: &ContentDigest,
) -> ReconcileResult<()> {
    if expected == found {
        return Ok(());
    }
    Err(ReconcileError::DigestMismatch {
        reference: reference.to_string(),
        expected: expected.to_string(),
        found: found.to_string(),
    })
}

/// Copy the whole stream into `device` through a fixed buffer, hashing as
/// it goes. A reporter task logs the copy rate until the copy ends.
async fn copy_into_device(
    backend: &dyn BlockBackend,
    device: &str,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    options: &ReconcilerOptions,
) -> ReconcileResult<(u64, ContentDigest)> {
    let copied = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = watch::channel(false);
    let reporter = tokio::spawn(report_rate(
        device.to_string(),
        Arc::clone(&copied),
        options.rate_report_interval,
        done_rx,
    ));

    let result = copy_loop(backend, device, reader, options.copy_buffer_size, &copied).await;

    done_tx.send_replace(true);
    finish_reporter(device, reporter).await;
    result
}

/// The reporter only logs, so its failure never fails the copy
async fn finish_reporter(device: &str, reporter: JoinHandle<()>) {
    if let Err(e) = reporter.await {
        warn!(device, error = %e, "copy rate reporter failed");
    }
}

async fn copy_loop(
    backend: &dyn BlockBackend,
    device: &str,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buffer_size: usize,
    copied: &AtomicU64,
) -> ReconcileResult<(u64, ContentDigest)> {
    let mut buf = vec![0u8; buffer_size];
    let mut calc = DigestCalculator::new();
    let mut offset = 0u64;

    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader
                .read(&mut buf[filled..])
                .await
                .map_err(SourceError::from)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        let chunk = &buf[..filled];
        calc.update(chunk);
        backend
            .write_at(device, offset, chunk)
            .await
            .context(|| format!("write {device} at {offset}"))?;
        offset += filled as u64;
        copied.store(offset, Ordering::Relaxed);

        if filled < buf.len() {
            break;
        }
    }

    Ok((offset, calc.finalize()))
}

async fn report_rate(
    device: String,
    copied: Arc<AtomicU64>,
    every: Duration,
    mut done: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = 0u64;

    loop {
        tokio::select! {
            _ = done.wait_for(|finished| *finished) => break,
            _ = ticker.tick() => {
                let total = copied.load(Ordering::Relaxed);
                #[allow(clippy::cast_precision_loss)]
                let rate = (total - last) as f64 / every.as_secs_f64() / MIB as f64;
                info!(device = %device, copied = total, rate_mib_s = %format!("{rate:.1}"), "copy progress");
                last = total;
            }
        }
    }

    let total = copied.load(Ordering::Relaxed);
    debug!(device = %device, copied = total, elapsed = ?started.elapsed(), "copy finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use volplane_block::{LocalContentSource, MemoryBackend};

    fn options() -> ReconcilerOptions {
        ReconcilerOptions {
            copy_buffer_size: 1000,
            ..ReconcilerOptions::new("rbd", "volplane")
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[tokio::test]
    async fn test_populate_creates_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(4321);
        std::fs::write(dir.path().join("os.img"), &data).unwrap();
        let source = LocalContentSource::new(dir.path());
        let backend = MemoryBackend::new();

        let digest = populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap();
        assert_eq!(digest, ContentDigest::compute(&data));

        let info = backend.open_device("os_a").await.unwrap();
        assert_eq!(info.size, MIB);
        assert_eq!(&backend.read_device("os_a").unwrap()[..data.len()], &data[..]);
        let snapshots = backend.list_snapshots("os_a").await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, VERSION_TAG);
    }

    #[tokio::test]
    async fn test_populate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("os.img"), b"content").unwrap();
        let source = LocalContentSource::new(dir.path());
        let backend = MemoryBackend::new();

        populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap();
        backend.clear_calls();
        populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_populated_device_keeps_its_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os.img");
        std::fs::write(&path, b"version A").unwrap();
        let source = LocalContentSource::new(dir.path());
        let backend = MemoryBackend::new();

        let first = populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap();
        assert_eq!(first, ContentDigest::compute(b"version A"));
        let metadata = backend.get_metadata("os_a").await.unwrap();
        assert_eq!(metadata.get(DIGEST_METADATA_KEY), Some(&first.to_string()));

        // The source moves on; the device still holds version A
        std::fs::write(&path, b"version B").unwrap();
        backend.clear_calls();
        let again = populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap();
        assert_eq!(again, first);
        assert!(backend.calls().is_empty());
        assert_eq!(&backend.read_device("os_a").unwrap()[..9], b"version A");

        std::fs::remove_file(&path).unwrap();
        let gone = populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap();
        assert_eq!(gone, first);
    }

    #[tokio::test]
    async fn test_populated_device_checked_against_expected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("os.img"), b"version A").unwrap();
        let source = LocalContentSource::new(dir.path());
        let backend = MemoryBackend::new();

        populate_snapshot(&backend, &source, &options(), "os.img", "snap_a", None)
            .await
            .unwrap();
        let other = ContentDigest::compute(b"version B");
        let err = populate_snapshot(&backend, &source, &options(), "os.img", "snap_a", Some(&other))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_reporter_panic_is_not_fatal() {
        let reporter = tokio::spawn(async { panic!("reporter blew up") });
        finish_reporter("os_a", reporter).await;
    }

    #[tokio::test]
    async fn test_interrupted_copy_redone() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(5000);
        std::fs::write(dir.path().join("os.img"), &data).unwrap();
        let source = LocalContentSource::new(dir.path());
        let backend = MemoryBackend::new();

        backend.fail_next("write_at", 1);
        let err = populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Backend { .. }));
        assert!(backend.contains("os_a"));

        populate_snapshot(&backend, &source, &options(), "os.img", "os_a", None)
            .await
            .unwrap();
        assert_eq!(&backend.read_device("os_a").unwrap()[..data.len()], &data[..]);
    }

    #[tokio::test]
    async fn test_expected_digest_checked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("os.img"), b"new content").unwrap();
        let source = LocalContentSource::new(dir.path());
        let backend = MemoryBackend::new();

        let stale = ContentDigest::compute(b"old content");
        let err = populate_snapshot(&backend, &source, &options(), "os.img", "snap_a", Some(&stale))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::DigestMismatch { .. }));
        assert!(!backend.contains("snap_a"));
    }

    #[tokio::test]
    async fn test_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.img"), b"").unwrap();
        let source = LocalContentSource::new(dir.path());
        let backend = MemoryBackend::new();

        let digest = populate_snapshot(&backend, &source, &options(), "empty.img", "os_e", None)
            .await
            .unwrap();
        assert_eq!(digest, ContentDigest::compute(b""));
        assert_eq!(backend.open_device("os_e").await.unwrap().size, MIB);
    }
}
