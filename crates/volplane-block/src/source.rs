//! External content sources for OS images
//!
//! Images and OS snapshots name their content by an opaque reference. A
//! [`ContentSource`] resolves a reference to its SHA-256 digest, used to
//! deduplicate snapshots, and opens it as a byte stream for population.

use crate::error::{SourceError, SourceResult};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
use volplane_common::{ContentDigest, DigestCalculator};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// An opened content reference
pub struct ContentStream {
    /// Content length in bytes
    pub size: u64,
    pub digest: ContentDigest,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream")
            .field("size", &self.size)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// Resolves and opens content references
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Digest of the content a reference currently points at
    async fn resolve(&self, reference: &str) -> SourceResult<ContentDigest>;

    /// Open a reference for streaming
    async fn open(&self, reference: &str) -> SourceResult<ContentStream>;
}

/// Serves references as file paths relative to a root directory
pub struct LocalContentSource {
    root: PathBuf,
    /// Digests keyed by path, valid while length and mtime are unchanged
    digests: Mutex<HashMap<PathBuf, (u64, Option<SystemTime>, ContentDigest)>>,
}

impl LocalContentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            digests: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, reference: &str) -> SourceResult<PathBuf> {
        let relative = Path::new(reference);
        let valid = !reference.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(SourceError::InvalidReference(reference.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn stat(path: &Path, reference: &str) -> SourceResult<std::fs::Metadata> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(meta),
            Ok(_) => Err(SourceError::NotFound(reference.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn hash_file(path: &Path) -> SourceResult<ContentDigest> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut calc = DigestCalculator::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            calc.update(&buf[..n]);
        }
        Ok(calc.finalize())
    }
}

#[async_trait]
impl ContentSource for LocalContentSource {
    async fn resolve(&self, reference: &str) -> SourceResult<ContentDigest> {
        let path = self.path_for(reference)?;
        let meta = Self::stat(&path, reference).await?;
        let len = meta.len();
        let modified = meta.modified().ok();

        if let Some((cached_len, cached_modified, digest)) = self.digests.lock().get(&path) {
            if *cached_len == len && *cached_modified == modified {
                return Ok(digest.clone());
            }
        }

        let digest = Self::hash_file(&path).await?;
        debug!(reference, %digest, size = len, "Hashed content");
        self.digests
            .lock()
            .insert(path, (len, modified, digest.clone()));
        Ok(digest)
    }

    async fn open(&self, reference: &str) -> SourceResult<ContentStream> {
        let digest = self.resolve(reference).await?;
        let path = self.path_for(reference)?;
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok(ContentStream {
            size,
            digest,
            reader: Box::new(file),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("debian.img"), b"debian bytes").unwrap();
        let source = LocalContentSource::new(dir.path());

        let digest = source.resolve("debian.img").await.unwrap();
        assert_eq!(digest, ContentDigest::compute(b"debian bytes"));
    }

    #[tokio::test]
    async fn test_identical_content_same_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mirror")).unwrap();
        std::fs::write(dir.path().join("a.img"), b"same").unwrap();
        std::fs::write(dir.path().join("mirror/b.img"), b"same").unwrap();
        let source = LocalContentSource::new(dir.path());

        assert_eq!(
            source.resolve("a.img").await.unwrap(),
            source.resolve("mirror/b.img").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_changed_content_rehashed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.img");
        std::fs::write(&path, b"one").unwrap();
        let source = LocalContentSource::new(dir.path());
        let first = source.resolve("a.img").await.unwrap();

        std::fs::write(&path, b"three").unwrap();
        let second = source.resolve("a.img").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(second, ContentDigest::compute(b"three"));
    }

    #[tokio::test]
    async fn test_open_stream() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("big.img"), &payload).unwrap();
        let source = LocalContentSource::new(dir.path());

        let mut stream = source.open("big.img").await.unwrap();
        assert_eq!(stream.size, payload.len() as u64);
        assert_eq!(stream.digest, ContentDigest::compute(&payload));

        let mut read = Vec::new();
        stream.reader.read_to_end(&mut read).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_invalid_references() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalContentSource::new(dir.path());

        for reference in ["", "../etc/passwd", "/etc/passwd", "a/../../b"] {
            assert!(
                matches!(
                    source.resolve(reference).await,
                    Err(SourceError::InvalidReference(_))
                ),
                "{reference} accepted"
            );
        }
        assert!(source.resolve("missing.img").await.unwrap_err().is_not_found());
    }
}
