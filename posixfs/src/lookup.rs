//! Path lookup
//!
//! Resolves `(spaceId, nodeId)` to absolute paths and back. Space roots live
//! directly under the configured root directory; every other node is found
//! through the id cache, falling back to xattr identification for the
//! forward direction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::attrs::{self, Attributes};
use common::{Error, Options, Result};
use metadata::MetadataBackend;

use crate::idcache::IdCache;
use crate::node::REVISION_DELIMITER;

pub struct Lookup {
    options: Arc<Options>,
    backend: Arc<dyn MetadataBackend>,
    id_cache: IdCache,
}

impl Lookup {
    pub fn new(options: Arc<Options>, backend: Arc<dyn MetadataBackend>) -> Self {
        let capacity = options.id_cache_capacity;
        Self {
            options,
            backend,
            id_cache: IdCache::new(capacity),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn metadata_backend(&self) -> &dyn MetadataBackend {
        self.backend.as_ref()
    }

    pub fn space_root_path(&self, space_id: &str) -> PathBuf {
        self.options.root.join(space_id)
    }

    /// Resolve a node id to its current path. Revision keys
    /// (`<nodeId>.REV.<ts>`) resolve to the revision file next to the node.
    pub async fn internal_path(&self, space_id: &str, id: &str) -> Result<PathBuf> {
        if let Some((node_id, timestamp)) = id.split_once(REVISION_DELIMITER) {
            return Box::pin(self.version_path(space_id, node_id, timestamp)).await;
        }
        if id == space_id {
            return Ok(self.space_root_path(space_id));
        }
        self.id_cache
            .get(space_id, id)
            .await
            .ok_or_else(|| Error::NotFound(format!("node {} in space {}", id, space_id)))
    }

    /// Deterministic path of a revision of the node.
    pub async fn version_path(
        &self,
        space_id: &str,
        node_id: &str,
        timestamp: &str,
    ) -> Result<PathBuf> {
        let node_path = self.internal_path(space_id, node_id).await?;
        let mut os = node_path.into_os_string();
        os.push(format!("{}{}", REVISION_DELIMITER, timestamp));
        Ok(PathBuf::from(os))
    }

    /// Read `(spaceId, nodeId)` from the path's xattrs, resolving the space
    /// by walking ancestors until an xattr-tagged space root is found.
    pub async fn ids_for_path(&self, path: &Path) -> Result<(String, String)> {
        let identity = self.backend.identify_path(path).await?;
        let id = identity
            .id
            .ok_or_else(|| Error::NotFound(format!("no id on {}", path.display())))?;
        if let Some(space_id) = identity.space_id {
            return Ok((space_id, id));
        }

        let mut candidate = path.to_path_buf();
        while let Some(parent) = candidate.parent() {
            candidate = parent.to_path_buf();
            if !candidate.starts_with(&self.options.root) || candidate == self.options.root {
                break;
            }
            match self.backend.identify_path(&candidate).await {
                Ok(identity) => {
                    if let Some(space_id) = identity.space_id {
                        return Ok((space_id, id));
                    }
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound(format!(
            "could not find space for {}",
            path.display()
        )))
    }

    pub async fn cache_id(&self, space_id: &str, id: &str, path: &Path) {
        self.id_cache.cache_id(space_id, id, path).await;
    }

    pub async fn get_cached_id(&self, space_id: &str, id: &str) -> Option<PathBuf> {
        self.id_cache.get(space_id, id).await
    }

    pub fn id_cache(&self) -> &IdCache {
        &self.id_cache
    }

    /// Copy the attributes selected by `filter` from one path to another.
    /// With `acquire_target_lock` the target's metadata lock is held for the
    /// write; when the caller already holds a lock covering both paths it
    /// passes `false`.
    pub async fn copy_metadata<F>(
        &self,
        source: &Path,
        target: &Path,
        filter: F,
        acquire_target_lock: bool,
    ) -> Result<()>
    where
        F: Fn(&str) -> bool + Send,
    {
        let source_attrs = self.backend.all(source).await?;
        let mut filtered = Attributes::new();
        for (key, value) in &source_attrs.0 {
            if filter(key) {
                filtered.set(key, value.clone());
            }
        }
        self.backend
            .set_multiple(target, &filtered, acquire_target_lock)
            .await
    }

    /// Blob reference of a node or revision path.
    pub async fn read_blob_id_and_size(&self, path: &Path) -> Result<(Option<String>, i64)> {
        let blob_id = match self.backend.get(path, attrs::BLOBID_ATTR).await {
            Ok(raw) => Some(String::from_utf8_lossy(&raw).into_owned()),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let size = match self.backend.get_i64(path, attrs::BLOBSIZE_ATTR).await {
            Ok(size) => size,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        Ok((blob_id, size))
    }
}

/// Attribute filter used when snapshotting a node's blob metadata onto a
/// revision (and back on restore).
pub fn blob_attribute_filter(include_mtime: bool) -> impl Fn(&str) -> bool + Send {
    move |key: &str| {
        key.starts_with(attrs::CHECKSUM_PREFIX)
            || key == attrs::TYPE_ATTR
            || key == attrs::BLOBID_ATTR
            || key == attrs::BLOBSIZE_ATTR
            || (include_mtime && key == attrs::MTIME_ATTR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadata::XattrsBackend;
    use tempfile::TempDir;

    fn make_lookup(root: &Path) -> Lookup {
        let options = Arc::new(Options::new(root));
        Lookup::new(options, Arc::new(XattrsBackend::new()))
    }

    #[tokio::test]
    async fn test_internal_path_space_root_and_cached() {
        let dir = TempDir::new().unwrap();
        let lookup = make_lookup(dir.path());

        assert_eq!(
            lookup.internal_path("s1", "s1").await.unwrap(),
            dir.path().join("s1")
        );

        assert!(lookup
            .internal_path("s1", "n1")
            .await
            .unwrap_err()
            .is_not_found());

        let node_path = dir.path().join("s1/a/f");
        lookup.cache_id("s1", "n1", &node_path).await;
        assert_eq!(lookup.internal_path("s1", "n1").await.unwrap(), node_path);
    }

    #[tokio::test]
    async fn test_version_path() {
        let dir = TempDir::new().unwrap();
        let lookup = make_lookup(dir.path());
        let node_path = dir.path().join("s1/a/f");
        lookup.cache_id("s1", "n1", &node_path).await;

        let ts = "2024-06-01T08:00:00.000000000Z";
        let version = lookup.version_path("s1", "n1", ts).await.unwrap();
        assert_eq!(
            version,
            dir.path().join(format!("s1/a/f.REV.{}", ts))
        );
        // revision keys resolve through internal_path as well
        assert_eq!(
            lookup
                .internal_path("s1", &format!("n1.REV.{}", ts))
                .await
                .unwrap(),
            version
        );
    }

    #[tokio::test]
    async fn test_ids_for_path_walks_to_space_root() {
        let dir = TempDir::new().unwrap();
        let lookup = make_lookup(dir.path());
        let backend = lookup.metadata_backend();

        let root = dir.path().join("s1");
        let sub = root.join("a");
        std::fs::create_dir_all(&sub).unwrap();
        let file = sub.join("f");
        std::fs::write(&file, b"x").unwrap();

        backend.set(&root, attrs::ID_ATTR, b"s1").await.unwrap();
        backend
            .set(&root, attrs::OWNER_ID_ATTR, b"alice")
            .await
            .unwrap();
        backend.set(&file, attrs::ID_ATTR, b"n1").await.unwrap();

        let (space_id, id) = lookup.ids_for_path(&file).await.unwrap();
        assert_eq!(space_id, "s1");
        assert_eq!(id, "n1");

        let (space_id, id) = lookup.ids_for_path(&root).await.unwrap();
        assert_eq!(space_id, "s1");
        assert_eq!(id, "s1");

        // a path without an id is not a node
        assert!(lookup.ids_for_path(&sub).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_copy_metadata_filters() {
        let dir = TempDir::new().unwrap();
        let lookup = make_lookup(dir.path());
        let backend = lookup.metadata_backend();

        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"x").unwrap();
        std::fs::write(&dst, b"y").unwrap();

        backend.set(&src, attrs::BLOBID_ATTR, b"b1").await.unwrap();
        backend.set(&src, attrs::NAME_ATTR, b"src").await.unwrap();
        let cs_key = format!("{}md5", attrs::CHECKSUM_PREFIX);
        backend.set(&src, &cs_key, &[0xAA, 0xBB]).await.unwrap();

        lookup
            .copy_metadata(&src, &dst, blob_attribute_filter(false), false)
            .await
            .unwrap();

        assert_eq!(backend.get(&dst, attrs::BLOBID_ATTR).await.unwrap(), b"b1");
        assert_eq!(backend.get(&dst, &cs_key).await.unwrap(), vec![0xAA, 0xBB]);
        assert!(backend
            .get(&dst, attrs::NAME_ATTR)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
