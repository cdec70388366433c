//! Per-space trashbin
//!
//! Soft-deleted nodes move under `<spaceRoot>/.Trash/files/<key>.trashitem`
//! with a freedesktop-style `.trashinfo` sidecar under `.Trash/info/`. The
//! move is an atomic rename within the space, so content and xattrs survive
//! for restore. `DeletionDate` is written and parsed as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use common::attrs::{self, NodeType};
use common::events::Event;
use common::{Error, Result};

use crate::node::Node;
use crate::tree::Tree;

const TRASH_HEADER: &str = "[Trash Info]";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A listed trash entry.
#[derive(Debug, Clone)]
pub struct RecycleItem {
    /// `<key>` for top-level items, `<key>/<relative>` for descendants.
    pub key: String,
    pub size: i64,
    pub node_type: NodeType,
    /// Original path relative to the space root.
    pub original_path: String,
    pub deletion_time: Option<DateTime<Utc>>,
}

/// Where to put a restored item: a base node plus a path relative to it.
#[derive(Debug, Clone)]
pub struct RestoreRef {
    pub node_id: String,
    pub path: String,
}

pub struct Trashbin {
    tree: Arc<Tree>,
}

impl Trashbin {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self { tree }
    }

    fn trash_root(&self, space_id: &str) -> PathBuf {
        self.tree.lookup.space_root_path(space_id).join(".Trash")
    }

    async fn write_info_file(&self, trash_root: &Path, key: &str, rel_path: &str) -> Result<()> {
        let content = format!(
            "{}\nPath={}\nDeletionDate={}",
            TRASH_HEADER,
            rel_path,
            Utc::now().format(TIME_FORMAT)
        );
        tokio::fs::write(
            trash_root.join("info").join(format!("{}.trashinfo", key)),
            content,
        )
        .await?;
        Ok(())
    }

    async fn read_info_file(
        &self,
        trash_root: &Path,
        key: &str,
    ) -> Result<(String, Option<DateTime<Utc>>)> {
        let info_path = trash_root.join("info").join(format!("{}.trashinfo", key));
        let content = match tokio::fs::read_to_string(&info_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        parse_trash_info(&content)
    }

    /// Soft-delete a node into the space's trash.
    pub async fn move_to_trash(&self, node: &Node) -> Result<String> {
        let key = Uuid::new_v4().to_string();
        let trash_root = self.trash_root(&node.space_id);
        tokio::fs::create_dir_all(trash_root.join("info")).await?;
        tokio::fs::create_dir_all(trash_root.join("files")).await?;

        let space_root = self.tree.lookup.space_root_path(&node.space_id);
        let rel_path = node
            .path
            .strip_prefix(&space_root)
            .map_err(|_| Error::InvalidPath(node.path.display().to_string()))?
            .to_string_lossy()
            .into_owned();
        self.write_info_file(&trash_root, &key, &rel_path).await?;

        let size = self.tree.subtree_size(node).await?;

        self.tree.lookup.id_cache().delete_by_path(&node.path).await;

        let item_path = trash_root.join("files").join(format!("{}.trashitem", key));
        tokio::fs::rename(&node.path, &item_path).await?;

        self.tree.propagate(node, -size).await?;

        let owner = node.owner(&self.tree.lookup).await.unwrap_or_default();
        self.tree.publish_event(Event::ItemTrashed {
            owner,
            node: node.node_ref(),
            key: key.clone(),
            timestamp: Utc::now(),
        });
        Ok(key)
    }

    /// List trash items. With an empty `key`, the top level of the trash;
    /// otherwise the entries inside the trashed directory `key` at
    /// `relative_path`, which inherit the parent item's deletion time.
    pub async fn list_recycle(
        &self,
        space_id: &str,
        key: &str,
        relative_path: &str,
    ) -> Result<Vec<RecycleItem>> {
        let trash_root = self.trash_root(space_id);
        let mut base = trash_root.join("files");

        let mut original_path = String::new();
        let mut deletion_time = None;
        if !key.is_empty() {
            base = base.join(format!("{}.trashitem", key)).join(relative_path);
            let (path, ts) = self.read_info_file(&trash_root, key).await?;
            original_path = join_relative(&path, relative_path);
            deletion_time = ts;
        }

        let mut items = Vec::new();
        let mut entries = match tokio::fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
            Err(e) => return Err(e.into()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };

            let (entry_key, entry_original, entry_ts) =
                if let Some(stripped) = name.strip_suffix(".trashitem") {
                    match self.read_info_file(&trash_root, stripped).await {
                        Ok((path, ts)) => (stripped.to_string(), path, ts),
                        Err(_) => continue,
                    }
                } else {
                    (
                        name.clone(),
                        join_relative(&original_path, &name),
                        deletion_time,
                    )
                };

            items.push(RecycleItem {
                key: join_key(key, relative_path, &entry_key),
                size: meta.len() as i64,
                node_type: if meta.is_dir() {
                    NodeType::Container
                } else {
                    NodeType::File
                },
                original_path: entry_original,
                deletion_time: entry_ts,
            });
        }
        Ok(items)
    }

    /// Restore a trashed item (or a descendant of one) to the given target.
    pub async fn restore_recycle_item(
        &self,
        space_id: &str,
        key: &str,
        relative_path: &str,
        restore_ref: &RestoreRef,
    ) -> Result<()> {
        let trash_root = self.trash_root(space_id);
        let trash_path = clean_join(
            trash_root.join("files").join(format!("{}.trashitem", key)),
            relative_path,
        );

        let restore_base = self
            .tree
            .lookup
            .internal_path(space_id, &restore_ref.node_id)
            .await?;
        let restore_path = clean_join(restore_base, &restore_ref.path);

        let backend = self.tree.lookup.metadata_backend();
        let identity = backend.identify_path(&trash_path).await?;
        let id = identity
            .id
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        // the item may be restored to a different location than it was
        // deleted from
        let restore_parent = restore_path
            .parent()
            .ok_or_else(|| Error::InvalidPath(restore_path.display().to_string()))?;
        let parent_identity = backend.identify_path(restore_parent).await?;
        let parent_id = parent_identity.id.ok_or_else(|| {
            Error::Internal(format!("parent id not found for {}", restore_path.display()))
        })?;
        backend
            .set(&trash_path, attrs::PARENTID_ATTR, parent_id.as_bytes())
            .await?;

        tokio::fs::rename(&trash_path, &restore_path).await?;
        self.tree.lookup.cache_id(space_id, &id, &restore_path).await;

        let restored = Node::read(&self.tree.lookup, space_id, &id).await?;
        let size = self.tree.subtree_size(&restored).await?;
        self.tree.propagate(&restored, size).await?;

        let owner = restored.owner(&self.tree.lookup).await.unwrap_or_default();
        self.tree.publish_event(Event::ItemRestored {
            owner,
            node: restored.node_ref(),
            key: key.to_string(),
            timestamp: Utc::now(),
        });

        if is_whole_item(relative_path) {
            tokio::fs::remove_file(trash_root.join("info").join(format!("{}.trashinfo", key)))
                .await?;
        }
        Ok(())
    }

    /// Hard-delete a trash item (or a descendant of one).
    pub async fn purge_recycle_item(
        &self,
        space_id: &str,
        key: &str,
        relative_path: &str,
    ) -> Result<()> {
        let space_root = Node::read(&self.tree.lookup, space_id, space_id).await?;
        let rp = self
            .tree
            .permissions
            .assemble_trash_permissions(&space_root)
            .await?;
        if !rp.purge_recycle {
            if rp.stat {
                return Err(Error::PermissionDenied(key.to_string()));
            }
            return Err(Error::NotFound(key.to_string()));
        }

        let trash_root = self.trash_root(space_id);
        let target = clean_join(
            trash_root.join("files").join(format!("{}.trashitem", key)),
            relative_path,
        );
        remove_all(&target).await?;

        if is_whole_item(relative_path) {
            match tokio::fs::remove_file(
                trash_root.join("info").join(format!("{}.trashinfo", key)),
            )
            .await
            {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let owner = space_root.owner(&self.tree.lookup).await.unwrap_or_default();
        self.tree.publish_event(Event::ItemPurged {
            owner,
            space_id: space_id.to_string(),
            key: key.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Hard-delete the whole trash of a space.
    pub async fn empty_recycle(&self, space_id: &str) -> Result<()> {
        let space_root = Node::read(&self.tree.lookup, space_id, space_id).await?;
        let rp = self
            .tree
            .permissions
            .assemble_trash_permissions(&space_root)
            .await?;
        if !rp.list_recycle && !rp.purge_recycle {
            if rp.stat {
                return Err(Error::PermissionDenied(space_id.to_string()));
            }
            return Err(Error::NotFound(space_id.to_string()));
        }

        let trash_root = self.trash_root(space_id);
        remove_all(&trash_root.join("files")).await?;
        remove_all(&trash_root.join("info")).await?;

        let owner = space_root.owner(&self.tree.lookup).await.unwrap_or_default();
        self.tree.publish_event(Event::ItemPurged {
            owner,
            space_id: space_id.to_string(),
            key: String::new(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// Lenient `.trashinfo` parser: only `Path=` and `DeletionDate=` lines are
/// consumed, anything else is ignored.
fn parse_trash_info(content: &str) -> Result<(String, Option<DateTime<Utc>>)> {
    let mut path = String::new();
    let mut ts = None;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("DeletionDate=") {
            let parsed = NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT)
                .map_err(|e| Error::Internal(format!("invalid DeletionDate: {}", e)))?;
            ts = Some(parsed.and_utc());
        }
        if let Some(value) = line.strip_prefix("Path=") {
            path = value.to_string();
        }
    }
    Ok((path, ts))
}

fn is_whole_item(relative_path: &str) -> bool {
    matches!(relative_path, "" | "." | "/")
}

fn join_relative(base: &str, relative: &str) -> String {
    if is_whole_item(relative) {
        base.to_string()
    } else if base.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), relative)
    }
}

fn join_key(key: &str, relative_path: &str, entry_key: &str) -> String {
    let mut parts = Vec::new();
    if !key.is_empty() {
        parts.push(key);
    }
    if !is_whole_item(relative_path) {
        parts.push(relative_path);
    }
    parts.push(entry_key);
    parts.join("/")
}

fn clean_join(base: PathBuf, relative: &str) -> PathBuf {
    if is_whole_item(relative) {
        base
    } else {
        base.join(relative.trim_start_matches('/'))
    }
}

async fn remove_all(path: &Path) -> Result<()> {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trash_info() {
        let (path, ts) = parse_trash_info(
            "[Trash Info]\nPath=a/g\nDeletionDate=2024-06-01T08:15:30",
        )
        .unwrap();
        assert_eq!(path, "a/g");
        let ts = ts.unwrap();
        assert_eq!(ts.format(TIME_FORMAT).to_string(), "2024-06-01T08:15:30");
    }

    #[test]
    fn test_parse_trash_info_ignores_unknown_lines() {
        let (path, ts) = parse_trash_info(
            "[Trash Info]\nFoo=bar\nPath=deep/nested/file.txt\nSomething else entirely",
        )
        .unwrap();
        assert_eq!(path, "deep/nested/file.txt");
        assert!(ts.is_none());
    }

    #[test]
    fn test_parse_trash_info_rejects_bad_date() {
        assert!(parse_trash_info("Path=x\nDeletionDate=yesterday").is_err());
    }

    #[test]
    fn test_key_and_path_helpers() {
        assert_eq!(join_key("", "", "k1"), "k1");
        assert_eq!(join_key("k1", ".", "child"), "k1/child");
        assert_eq!(join_key("k1", "sub", "child"), "k1/sub/child");
        assert_eq!(join_relative("a/g", "."), "a/g");
        assert_eq!(join_relative("a", "g/h"), "a/g/h");
        assert!(is_whole_item(""));
        assert!(is_whole_item("."));
        assert!(!is_whole_item("sub"));
    }
}
