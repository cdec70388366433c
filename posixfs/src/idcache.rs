//! Bidirectional id cache
//!
//! Maps `(spaceId, nodeId)` to the node's current absolute path and back.
//! Write-through: both directions are updated together on `cache_id`. A
//! forward miss falls back to xattr identification in the lookup layer; a
//! stale or evicted entry is repaired by the next warmup, so readers may
//! briefly observe an outdated path.

use moka::future::Cache;
use std::path::{Path, PathBuf};

/// Cache key for the forward direction.
type IdKey = (String, String);

pub struct IdCache {
    by_id: Cache<IdKey, PathBuf>,
    by_path: Cache<PathBuf, IdKey>,
}

impl IdCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            by_id: Cache::builder().max_capacity(capacity).build(),
            by_path: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Store both directions for the binding.
    pub async fn cache_id(&self, space_id: &str, id: &str, path: &Path) {
        let key = (space_id.to_string(), id.to_string());
        self.by_id.insert(key.clone(), path.to_path_buf()).await;
        self.by_path.insert(path.to_path_buf(), key).await;
    }

    pub async fn get(&self, space_id: &str, id: &str) -> Option<PathBuf> {
        self.by_id
            .get(&(space_id.to_string(), id.to_string()))
            .await
    }

    pub async fn get_by_path(&self, path: &Path) -> Option<(String, String)> {
        self.by_path.get(&path.to_path_buf()).await
    }

    /// Remove only the reverse entry. Used when a path disappears but the id
    /// stays valid at its new location.
    pub async fn delete_path(&self, path: &Path) {
        self.by_path.invalidate(&path.to_path_buf()).await;
    }

    /// Remove the binding in both directions, resolved by path.
    pub async fn delete_by_path(&self, path: &Path) {
        if let Some(key) = self.by_path.get(&path.to_path_buf()).await {
            self.by_id.invalidate(&key).await;
        }
        self.by_path.invalidate(&path.to_path_buf()).await;
    }
}
