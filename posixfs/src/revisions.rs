//! Revision engine
//!
//! Revisions are sibling files named `<node>.REV.<RFC3339Nano>` co-located
//! with the live node. Same directory means same filesystem, so creating and
//! restoring a revision never crosses a partition boundary and renames stay
//! atomic.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use common::attrs;
use common::{Error, Result};
use metadata::LockedFile;

use crate::blobstore::BlobReader;
use crate::lookup::blob_attribute_filter;
use crate::node::{self, Node, REVISION_DELIMITER};
use crate::permissions::ResourcePermissions;
use crate::tree::Tree;

/// A single revision of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    /// `<nodeId>.REV.<timestamp>`
    pub key: String,
    pub mtime: DateTime<Utc>,
    pub size: i64,
    pub etag: String,
}

/// Resource description returned alongside a revision download.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub node_id: String,
    pub name: String,
    pub size: i64,
    pub mtime: DateTime<Utc>,
    pub etag: String,
}

fn split_revision_key(revision_key: &str) -> Result<(&str, &str)> {
    revision_key
        .split_once(REVISION_DELIMITER)
        .ok_or_else(|| Error::NotFound(revision_key.to_string()))
}

/// `NotFound` unless the caller may stat the node, `PermissionDenied`
/// otherwise. Keeps callers from probing for existence.
fn denied(rp: &ResourcePermissions, what: &str) -> Error {
    if rp.stat {
        Error::PermissionDenied(what.to_string())
    } else {
        Error::NotFound(what.to_string())
    }
}

impl Tree {
    /// Snapshot the node's current content and blob metadata into a new
    /// revision file. The caller holds the node's metadata lock. Fails with
    /// `AlreadyExists` when a revision with this timestamp is present.
    pub async fn create_revision(
        &self,
        node: &Node,
        timestamp: &str,
        _lock: &LockedFile,
    ) -> Result<PathBuf> {
        let version_path = self
            .lookup
            .version_path(&node.space_id, &node.id, timestamp)
            .await?;

        let mut source = tokio::fs::File::open(&node.path).await?;
        let mut version_file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&version_path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(version_path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        tokio::io::copy(&mut source, &mut version_file).await?;
        version_file.flush().await?;
        drop(version_file);

        self.lookup
            .copy_metadata(&node.path, &version_path, blob_attribute_filter(true), false)
            .await?;

        Ok(version_path)
    }

    /// List all revisions of a node, newest last in directory order.
    pub async fn list_revisions(&self, node: &Node) -> Result<Vec<FileVersion>> {
        if !node.exists {
            return Err(Error::NotFound(node.id.clone()));
        }
        let rp = self.permissions.assemble_permissions(node).await?;
        if !rp.list_file_versions {
            return Err(denied(&rp, &node.id));
        }

        let backend = self.lookup.metadata_backend();
        let dir = node
            .path
            .parent()
            .ok_or_else(|| Error::InvalidPath(node.path.display().to_string()))?;
        let prefix = format!(
            "{}{}",
            node.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            REVISION_DELIMITER
        );

        let mut revisions = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            if backend.is_meta_file(&path) || name.ends_with(".mlock") {
                continue;
            }
            let timestamp = &name[prefix.len()..];
            let Ok(mtime) = attrs::parse_time(timestamp) else {
                tracing::error!("invalid revision name {}, skipping", name);
                continue;
            };
            let (_, size) = self.lookup.read_blob_id_and_size(&path).await.unwrap_or_else(|e| {
                tracing::error!("error reading blobsize of {}, using 0: {}", name, e);
                (None, 0)
            });
            revisions.push(FileVersion {
                key: format!("{}{}{}", node.id, REVISION_DELIMITER, timestamp),
                mtime,
                size,
                etag: node::calculate_etag(&node.id, mtime),
            });
        }
        Ok(revisions)
    }

    /// Open a revision for download. The reader is only opened when
    /// `open_reader` approves the resource info (e.g. after range checks).
    pub async fn download_revision<F>(
        &self,
        space_id: &str,
        revision_key: &str,
        open_reader: F,
    ) -> Result<(ResourceInfo, Option<BlobReader>)>
    where
        F: FnOnce(&ResourceInfo) -> bool,
    {
        let (node_id, timestamp) = split_revision_key(revision_key)?;
        let node = Node::read(&self.lookup, space_id, node_id).await?;
        if !node.exists {
            return Err(Error::NotFound(revision_key.to_string()));
        }
        let rp = self.permissions.assemble_permissions(&node).await?;
        if !rp.list_file_versions || !rp.initiate_file_download {
            return Err(denied(&rp, revision_key));
        }

        let content_path = self.lookup.internal_path(space_id, revision_key).await?;
        let (_, size) = self.lookup.read_blob_id_and_size(&content_path).await?;
        let mtime = attrs::parse_time(timestamp)?;
        let info = ResourceInfo {
            node_id: node.id.clone(),
            name: node.name.clone(),
            size,
            mtime,
            etag: node::calculate_etag(&node.id, mtime),
        };

        let reader = if open_reader(&info) {
            Some(self.blobstore.read_blob(&content_path).await?)
        } else {
            None
        };
        Ok((info, reader))
    }

    /// Replace the node's content and blob metadata with those of the given
    /// revision. The version being replaced is preserved as a new revision
    /// first; on failure that new revision is removed again.
    pub async fn restore_revision(&self, space_id: &str, revision_key: &str) -> Result<()> {
        let (node_id, _) = split_revision_key(revision_key)?;
        let node = Node::read(&self.lookup, space_id, node_id).await?;
        if !node.exists {
            return Err(Error::NotFound(revision_key.to_string()));
        }
        let rp = self.permissions.assemble_permissions(&node).await?;
        if !rp.restore_file_version {
            return Err(denied(&rp, revision_key));
        }

        let backend = self.lookup.metadata_backend();
        let lock = backend.lock(&node.path).await?;

        let mtime = node.mtime(backend).await?;
        let new_timestamp = attrs::format_time(mtime);
        let (new_revision_path, created) =
            match self.create_revision(&node, &new_timestamp, &lock).await {
                Ok(p) => (p, true),
                Err(Error::AlreadyExists(_)) => {
                    // the current state is already captured by that revision
                    let p = self
                        .lookup
                        .version_path(space_id, node_id, &new_timestamp)
                        .await?;
                    (p, false)
                }
                Err(e) => return Err(e),
            };

        let result = self
            .restore_revision_locked(space_id, revision_key, &node, &new_revision_path, mtime)
            .await;
        if result.is_err() && created {
            // compensation: drop the snapshot taken above
            if let Err(e) = tokio::fs::remove_file(&new_revision_path).await {
                tracing::error!(
                    "could not clean up revision {}: {}",
                    new_revision_path.display(),
                    e
                );
            }
            if let Err(e) = backend.purge(&new_revision_path).await {
                tracing::error!(
                    "could not clean up revision metadata {}: {}",
                    new_revision_path.display(),
                    e
                );
            }
        }
        result
    }

    async fn restore_revision_locked(
        &self,
        space_id: &str,
        revision_key: &str,
        node: &Node,
        new_revision_path: &std::path::Path,
        previous_mtime: DateTime<Utc>,
    ) -> Result<()> {
        let backend = self.lookup.metadata_backend();

        // the saved snapshot keeps the mtime of the state it captured
        let ft = FileTime::from_system_time(previous_mtime.into());
        let rev = new_revision_path.to_path_buf();
        tokio::task::spawn_blocking(move || filetime::set_file_times(&rev, ft, ft))
            .await
            .map_err(|e| Error::Internal(format!("chtimes task failed: {}", e)))?
            .map_err(|e| Error::Internal(format!("failed to change mtime of version: {}", e)))?;

        let restored_path = self.lookup.internal_path(space_id, revision_key).await?;
        if !restored_path.exists() {
            return Err(Error::NotFound(revision_key.to_string()));
        }
        let (_, restored_size) = self.lookup.read_blob_id_and_size(&restored_path).await?;

        tokio::fs::copy(&restored_path, &node.path).await?;
        self.lookup
            .copy_metadata(&restored_path, &node.path, blob_attribute_filter(false), false)
            .await?;
        backend
            .set(
                &node.path,
                attrs::MTIME_ATTR,
                attrs::format_time(Utc::now()).as_bytes(),
            )
            .await?;

        // drop the restored revision and its sidecars
        if let Err(e) = tokio::fs::remove_file(&restored_path).await {
            tracing::warn!(
                "could not delete old revision {}, continuing: {}",
                restored_path.display(),
                e
            );
        }
        match tokio::fs::remove_file(backend.lockfile_path(&restored_path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    "could not delete old revision lockfile of {}, continuing: {}",
                    restored_path.display(),
                    e
                );
            }
        }
        if let Err(e) = backend.purge(&restored_path).await {
            tracing::warn!(
                "could not purge old revision {}, continuing: {}",
                restored_path.display(),
                e
            );
        }

        let size_diff = restored_size - node.blobsize;
        self.propagate(node, size_diff).await?;

        let owner = node.owner(&self.lookup).await.unwrap_or_default();
        self.publish_event(common::events::Event::RevisionRestored {
            owner,
            node: node.node_ref(),
            revision_key: revision_key.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Remove a revision and its blob.
    pub async fn delete_revision(&self, space_id: &str, revision_key: &str) -> Result<()> {
        let (node_id, _) = split_revision_key(revision_key)?;
        let node = Node::read(&self.lookup, space_id, node_id).await?;
        if !node.exists {
            return Err(Error::NotFound(revision_key.to_string()));
        }
        let rp = self.permissions.assemble_permissions(&node).await?;
        if !rp.restore_file_version {
            return Err(denied(&rp, revision_key));
        }

        let revision_path = self.lookup.internal_path(space_id, revision_key).await?;
        match tokio::fs::remove_file(&revision_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.delete_blob(&revision_path).await
    }
}
