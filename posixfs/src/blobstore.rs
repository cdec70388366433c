//! Blob access
//!
//! The engine reads and writes blob content through this interface. The
//! POSIX implementation stores blobs in place: the node path (or revision
//! path) is the blob, so reads open the file directly and deletes remove it.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncRead;

use common::{Error, Result};

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open the blob stored at `path` for reading.
    async fn read_blob(&self, path: &Path) -> Result<BlobReader>;

    /// Copy the content of `source` into the blob at `path`, returning the
    /// number of bytes written.
    async fn write_blob(&self, path: &Path, source: &Path) -> Result<u64>;

    /// Remove the blob stored at `path`. Removing a missing blob is not an
    /// error.
    async fn delete_blob(&self, path: &Path) -> Result<()>;
}

/// Blob store operating on the co-located node and revision files.
#[derive(Debug, Default, Clone)]
pub struct PosixBlobStore;

impl PosixBlobStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BlobStore for PosixBlobStore {
    async fn read_blob(&self, path: &Path) -> Result<BlobReader> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn write_blob(&self, path: &Path, source: &Path) -> Result<u64> {
        let written = tokio::fs::copy(source, path).await?;
        Ok(written)
    }

    async fn delete_blob(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_write_delete() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let blob = dir.path().join("blob");
        tokio::fs::write(&source, b"abcdefgh").await.unwrap();

        let store = PosixBlobStore::new();
        assert_eq!(store.write_blob(&blob, &source).await.unwrap(), 8);

        let mut reader = store.read_blob(&blob).await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"abcdefgh");

        store.delete_blob(&blob).await.unwrap();
        match store.read_blob(&blob).await {
            Err(e) => assert!(e.is_not_found()),
            Ok(_) => panic!("expected NotFound error"),
        }
        // deleting twice is fine
        store.delete_blob(&blob).await.unwrap();
    }
}
