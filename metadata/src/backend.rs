//! Metadata backend trait
//!
//! The engine never touches extended attributes directly; it goes through
//! this interface so the persistence mechanism can be swapped out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use common::{Attributes, Result};

use crate::lockedfile::LockedFile;

/// Identification read from a path in one go: the space id if the path is a
/// space root, the node id if assigned, and the persisted mtime.
#[derive(Debug, Clone, Default)]
pub struct PathIdentity {
    pub space_id: Option<String>,
    pub id: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
}

/// Trait for metadata storage operations
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Read a single attribute. `Error::NotFound` when the attribute is unset
    /// or the path does not exist.
    async fn get(&self, path: &Path, key: &str) -> Result<Vec<u8>>;

    /// Read a single attribute as a decimal integer.
    async fn get_i64(&self, path: &Path, key: &str) -> Result<i64>;

    /// Write a single attribute.
    async fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()>;

    /// Write a set of attributes. With `acquire_lock` the node's metadata
    /// lock is taken for the duration of the write.
    async fn set_multiple(&self, path: &Path, attrs: &Attributes, acquire_lock: bool) -> Result<()>;

    /// Remove a single attribute. Removing an unset attribute is not an error.
    async fn remove(&self, path: &Path, key: &str) -> Result<()>;

    /// Read all attributes in the engine namespace. An existing path without
    /// attributes yields an empty map.
    async fn all(&self, path: &Path) -> Result<Attributes>;

    /// Drop all attributes in the engine namespace from the path.
    async fn purge(&self, path: &Path) -> Result<()>;

    /// Acquire the node's metadata lock (blocking until available).
    async fn lock(&self, path: &Path) -> Result<LockedFile>;

    /// Read space id, node id and mtime of a path in a single pass.
    async fn identify_path(&self, path: &Path) -> Result<PathIdentity>;

    /// True for sidecar files maintained by the backend itself.
    fn is_meta_file(&self, path: &Path) -> bool;

    /// Path of the lock sidecar for a node path.
    fn lockfile_path(&self, path: &Path) -> PathBuf;

    /// Path metadata is stored at. For the xattr backend this is the node
    /// path itself.
    fn metadata_path(&self, path: &Path) -> PathBuf;
}
