//! Extended-attribute metadata backend
//!
//! Attributes are stored directly on the node's inode under the `user.oc.`
//! namespace, so metadata travels with the file through renames and survives
//! out-of-band copies (`cp --preserve=xattr`). All xattr syscalls run on the
//! blocking pool.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use common::attrs::{self, Attributes};
use common::{Error, Result};

use crate::backend::{MetadataBackend, PathIdentity};
use crate::lockedfile::LockedFile;

const LOCK_SUFFIX: &str = ".mlock";

/// Metadata backend persisting attributes as extended attributes.
#[derive(Debug, Default, Clone)]
pub struct XattrsBackend;

impl XattrsBackend {
    pub fn new() -> Self {
        Self
    }
}

/// True when the error means "attribute not set" rather than a real failure.
/// ENODATA on Linux, ENOATTR (93) on macOS.
fn is_attr_unset(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENODATA) || e.raw_os_error() == Some(93)
}

fn get_blocking(path: &Path, key: &str) -> Result<Vec<u8>> {
    match xattr::get(path, key) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(Error::NotFound(format!(
            "attribute {} not set on {}",
            key,
            path.display()
        ))),
        Err(e) if is_attr_unset(&e) => Err(Error::NotFound(format!(
            "attribute {} not set on {}",
            key,
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn all_blocking(path: &Path) -> Result<Attributes> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut result = Attributes::new();
    for name in names {
        let key = name.to_string_lossy().into_owned();
        if !key.starts_with(attrs::OC_PREFIX) {
            continue;
        }
        match xattr::get(path, &key) {
            Ok(Some(value)) => result.set(&key, value),
            // removed concurrently, skip
            Ok(None) => continue,
            Err(e) if is_attr_unset(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(result)
}

#[async_trait]
impl MetadataBackend for XattrsBackend {
    async fn get(&self, path: &Path, key: &str) -> Result<Vec<u8>> {
        let path = path.to_path_buf();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || get_blocking(&path, &key))
            .await
            .map_err(|e| Error::Internal(format!("xattr task failed: {}", e)))?
    }

    async fn get_i64(&self, path: &Path, key: &str) -> Result<i64> {
        let raw = self.get(path, key).await?;
        String::from_utf8_lossy(&raw)
            .parse::<i64>()
            .map_err(|e| Error::Internal(format!("attribute {} is not an integer: {}", key, e)))
    }

    async fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        let path = path.to_path_buf();
        let key = key.to_string();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || {
            xattr::set(&path, &key, &value).map_err(Error::from)
        })
        .await
        .map_err(|e| Error::Internal(format!("xattr task failed: {}", e)))?
    }

    async fn set_multiple(&self, path: &Path, attrs: &Attributes, acquire_lock: bool) -> Result<()> {
        let _guard = if acquire_lock {
            Some(self.lock(path).await?)
        } else {
            None
        };

        let path = path.to_path_buf();
        let attrs = attrs.clone();
        tokio::task::spawn_blocking(move || {
            for (key, value) in &attrs.0 {
                xattr::set(&path, key, value)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("xattr task failed: {}", e)))?
    }

    async fn remove(&self, path: &Path, key: &str) -> Result<()> {
        let path = path.to_path_buf();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || match xattr::remove(&path, &key) {
            Ok(()) => Ok(()),
            Err(e) if is_attr_unset(&e) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
        .map_err(|e| Error::Internal(format!("xattr task failed: {}", e)))?
    }

    async fn all(&self, path: &Path) -> Result<Attributes> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || all_blocking(&path))
            .await
            .map_err(|e| Error::Internal(format!("xattr task failed: {}", e)))?
    }

    async fn purge(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let names = match xattr::list(&path) {
                Ok(names) => names,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(Error::from(e)),
            };
            for name in names {
                let key = name.to_string_lossy().into_owned();
                if key.starts_with(attrs::OC_PREFIX) {
                    match xattr::remove(&path, &key) {
                        Ok(()) => {}
                        Err(e) if is_attr_unset(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("xattr task failed: {}", e)))?
    }

    async fn lock(&self, path: &Path) -> Result<LockedFile> {
        LockedFile::open_exclusive(&self.lockfile_path(path)).await
    }

    async fn identify_path(&self, path: &Path) -> Result<PathIdentity> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Err(Error::NotFound(path.display().to_string()));
            }
            let mut identity = PathIdentity::default();
            if let Ok(id) = get_blocking(&path, attrs::ID_ATTR) {
                identity.id = Some(String::from_utf8_lossy(&id).into_owned());
            }
            // space roots are the only nodes carrying an owner
            if get_blocking(&path, attrs::OWNER_ID_ATTR).is_ok() {
                identity.space_id = identity.id.clone();
            }
            if let Ok(raw) = get_blocking(&path, attrs::MTIME_ATTR) {
                identity.mtime = attrs::parse_time(&String::from_utf8_lossy(&raw)).ok();
            }
            Ok(identity)
        })
        .await
        .map_err(|e| Error::Internal(format!("xattr task failed: {}", e)))?
    }

    fn is_meta_file(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.ends_with(LOCK_SUFFIX) || name.ends_with(".trashinfo")
    }

    fn lockfile_path(&self, path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_os_string();
        os.push(LOCK_SUFFIX);
        PathBuf::from(os)
    }

    fn metadata_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}
