//! Advisory exclusive file locks
//!
//! Metadata writes that span several operations (create revision, restore
//! revision, overwrite upload) hold an exclusive lock on the node's `.mlock`
//! sidecar. Locks are acquire-wait and released when the guard is dropped.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use common::{Error, Result};

/// An open file holding an exclusive advisory lock.
///
/// The lock is released on drop. The sidecar file is left in place to avoid
/// stale-handle races with concurrent lockers on network filesystems.
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Open (creating if necessary) and exclusively lock `path`, waiting for
    /// other holders to release.
    pub async fn open_exclusive(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(LockedFile { file, path })
        })
        .await
        .map_err(|e| Error::Internal(format!("lock task failed: {}", e)))?
    }

    /// Try to lock without waiting; `Error::LockTaken` if already held.
    pub async fn try_open_exclusive(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.try_lock_exclusive()
                .map_err(|_| Error::LockTaken(path.display().to_string()))?;
            Ok(LockedFile { file, path })
        })
        .await
        .map_err(|e| Error::Internal(format!("lock task failed: {}", e)))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_exclusive_lock_round_trip() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("node.mlock");

        let first = LockedFile::open_exclusive(&lock_path).await.unwrap();
        assert!(matches!(
            LockedFile::try_open_exclusive(&lock_path).await,
            Err(Error::LockTaken(_))
        ));

        drop(first);
        LockedFile::try_open_exclusive(&lock_path).await.unwrap();
    }
}
