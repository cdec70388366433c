//! Tree operations
//!
//! Owns the mutating operations on the node tree: space bootstrap, container
//! creation, moves, upward propagation of tree size and modification time,
//! and the reservation step of new uploads. Scan handling and assimilation
//! live in `assimilation`, revision management in `revisions`.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use common::attrs::{self, Attributes, NodeType};
use common::events::{Event, EventPublisher, UserId};
use common::{Error, Options, Result};
use metadata::LockedFile;

use crate::assimilation::{ScanDebouncer, ScanItem};
use crate::blobstore::BlobStore;
use crate::lookup::Lookup;
use crate::node::{self, Node};
use crate::permissions::PermissionsChecker;
use crate::usermapper::UserMapper;

pub struct Tree {
    pub(crate) lookup: Arc<Lookup>,
    pub(crate) blobstore: Arc<dyn BlobStore>,
    pub(crate) permissions: Arc<dyn PermissionsChecker>,
    pub(crate) usermapper: Arc<dyn UserMapper>,
    pub(crate) options: Arc<Options>,
    pub(crate) scan_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanItem>>>,
    pub(crate) debouncer: ScanDebouncer,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl Tree {
    pub fn new(
        lookup: Arc<Lookup>,
        blobstore: Arc<dyn BlobStore>,
        permissions: Arc<dyn PermissionsChecker>,
        publisher: Arc<dyn EventPublisher>,
        usermapper: Arc<dyn UserMapper>,
        options: Arc<Options>,
    ) -> Arc<Self> {
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let debouncer = ScanDebouncer::new(
            std::time::Duration::from_millis(options.scan_debounce_delay_ms),
            scan_tx,
        );

        // one queue keeps events for a node in the order their metadata
        // mutations committed
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Err(e) = publisher.publish(event).await {
                    tracing::error!("failed to publish event: {}", e);
                }
            }
        });

        Arc::new(Self {
            lookup,
            blobstore,
            permissions,
            usermapper,
            options,
            scan_rx: Mutex::new(Some(scan_rx)),
            debouncer,
            event_tx,
        })
    }

    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lookup
    }

    /// Bootstrap a space: a root directory whose node id equals the space id,
    /// tagged with its owner.
    pub async fn create_space(
        &self,
        space_id: Option<String>,
        owner: &UserId,
        quota: Option<i64>,
    ) -> Result<Node> {
        let space_id = space_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let path = self.lookup.space_root_path(&space_id);
        if path.exists() {
            return Err(Error::AlreadyExists(space_id));
        }
        tokio::fs::create_dir_all(&path).await?;

        let mut root_attrs = Attributes::new();
        root_attrs.set_string(attrs::ID_ATTR, &space_id);
        root_attrs.set_string(attrs::NAME_ATTR, &space_id);
        root_attrs.set_i64(attrs::TYPE_ATTR, NodeType::Container as i64);
        root_attrs.set_i64(attrs::TREESIZE_ATTR, 0);
        root_attrs.set_string(attrs::PROPAGATION_ATTR, "1");
        root_attrs.set_time(attrs::MTIME_ATTR, Utc::now());
        root_attrs.set_string(attrs::OWNER_IDP_ATTR, &owner.idp);
        root_attrs.set_string(attrs::OWNER_ID_ATTR, &owner.opaque_id);
        if let Some(quota) = quota {
            root_attrs.set_i64(attrs::QUOTA_ATTR, quota);
        }
        self.lookup
            .metadata_backend()
            .set_multiple(&path, &root_attrs, true)
            .await?;
        self.lookup.cache_id(&space_id, &space_id, &path).await;

        Node::read(&self.lookup, &space_id, &space_id).await
    }

    /// Create a directory node under the given parent.
    pub async fn create_container(
        &self,
        space_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Node> {
        let parent_path = self.lookup.internal_path(space_id, parent_id).await?;
        let path = parent_path.join(name);
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        tokio::fs::create_dir(&path).await?;

        let id = Uuid::new_v4().to_string();
        let mut dir_attrs = Attributes::new();
        dir_attrs.set_string(attrs::ID_ATTR, &id);
        dir_attrs.set_string(attrs::PARENTID_ATTR, parent_id);
        dir_attrs.set_string(attrs::NAME_ATTR, name);
        dir_attrs.set_i64(attrs::TYPE_ATTR, NodeType::Container as i64);
        dir_attrs.set_i64(attrs::TREESIZE_ATTR, 0);
        dir_attrs.set_string(attrs::PROPAGATION_ATTR, "1");
        dir_attrs.set_time(attrs::MTIME_ATTR, Utc::now());
        self.lookup
            .metadata_backend()
            .set_multiple(&path, &dir_attrs, true)
            .await?;
        self.lookup.cache_id(space_id, &id, &path).await;

        let container = Node::read(&self.lookup, space_id, &id).await?;
        self.propagate(&container, 0).await?;

        let owner = container.owner(&self.lookup).await.unwrap_or_default();
        self.publish_event(Event::ContainerCreated {
            owner,
            node: container.node_ref(),
            timestamp: Utc::now(),
        });
        Ok(container)
    }

    /// Move or rename a node within its space. The rename is atomic; the
    /// node keeps its id.
    pub async fn move_node(
        &self,
        space_id: &str,
        node_id: &str,
        target_parent_id: &str,
        new_name: &str,
    ) -> Result<()> {
        let node = Node::read(&self.lookup, space_id, node_id).await?;
        if !node.exists {
            return Err(Error::NotFound(node_id.to_string()));
        }
        let previous_parent_id = node.parent_id.clone();

        let target_parent_path = self.lookup.internal_path(space_id, target_parent_id).await?;
        let target_path = target_parent_path.join(new_name);
        if target_path.exists() {
            return Err(Error::AlreadyExists(target_path.display().to_string()));
        }

        let size = self.subtree_size(&node).await?;

        tokio::fs::rename(&node.path, &target_path).await?;

        // pull the size out of the old ancestor chain; the old parents are
        // still in place after the rename
        self.propagate(&node, -size).await?;

        let backend = self.lookup.metadata_backend();
        let mut moved_attrs = Attributes::new();
        moved_attrs.set_string(attrs::PARENTID_ATTR, target_parent_id);
        moved_attrs.set_string(attrs::NAME_ATTR, new_name);
        backend.set_multiple(&target_path, &moved_attrs, true).await?;

        self.lookup.cache_id(space_id, node_id, &target_path).await;
        self.lookup.id_cache().delete_path(&node.path).await;

        let mut moved = node.clone();
        moved.path = target_path;
        moved.parent_id = target_parent_id.to_string();
        moved.name = new_name.to_string();
        self.propagate(&moved, size).await?;

        let owner = moved.owner(&self.lookup).await.unwrap_or_default();
        self.publish_event(Event::ItemMoved {
            owner,
            node: moved.node_ref(),
            parent_id: target_parent_id.to_string(),
            previous_parent_id,
            name: new_name.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Bytes a node contributes to its ancestors' tree size.
    pub(crate) async fn subtree_size(&self, node: &Node) -> Result<i64> {
        if node.node_type.is_container() {
            match self
                .lookup
                .metadata_backend()
                .get_i64(&node.path, attrs::TREESIZE_ATTR)
                .await
            {
                Ok(size) => Ok(size),
                Err(e) if e.is_not_found() => Ok(0),
                Err(e) => Err(e),
            }
        } else {
            Ok(node.blobsize)
        }
    }

    /// Reserve the target of a new upload: lock the node metadata, verify the
    /// target is free, check the quota and create an empty placeholder. The
    /// returned lock is held until the caller finished writing metadata.
    pub async fn init_new_node(&self, node: &Node, size: i64) -> Result<LockedFile> {
        let backend = self.lookup.metadata_backend();
        let guard = backend.lock(&node.path).await?;

        if node.path.exists() {
            return Err(Error::AlreadyExists(node.path.display().to_string()));
        }
        let space_root_path = self.lookup.space_root_path(&node.space_id);
        node::check_quota(backend, &space_root_path, 0, size).await?;

        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&node.path)
            .await?;
        Ok(guard)
    }

    /// Propagate a size change from the node's parent up to the space root,
    /// refreshing each ancestor's modification time. A zero diff only
    /// refreshes timestamps.
    pub async fn propagate(&self, node: &Node, size_diff: i64) -> Result<()> {
        let backend = self.lookup.metadata_backend();
        let space_root_path = self.lookup.space_root_path(&node.space_id);
        let now = Utc::now();

        let mut current = match node.path.parent() {
            Some(p) => p.to_path_buf(),
            None => return Ok(()),
        };
        loop {
            if !current.starts_with(&self.options.root) || current == self.options.root {
                break;
            }
            let propagation = backend.get(&current, attrs::PROPAGATION_ATTR).await;
            match propagation {
                Ok(raw) if raw == b"1" => {}
                Ok(_) => break,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }

            let mut updated = Attributes::new();
            if size_diff != 0 {
                let tree_size = match backend.get_i64(&current, attrs::TREESIZE_ATTR).await {
                    Ok(size) => size,
                    Err(e) if e.is_not_found() => 0,
                    Err(e) => return Err(e),
                };
                updated.set_i64(attrs::TREESIZE_ATTR, tree_size + size_diff);
            }
            updated.set_time(attrs::MTIME_ATTR, now);
            backend.set_multiple(&current, &updated, false).await?;

            if current == space_root_path {
                break;
            }
            current = match current.parent() {
                Some(p) => p.to_path_buf(),
                None => break,
            };
        }
        Ok(())
    }

    /// Remove a node's blob through the configured blob store.
    pub async fn delete_blob(&self, path: &Path) -> Result<()> {
        self.blobstore.delete_blob(path).await
    }

    /// Fire-and-forget event emission; failures are logged, never surfaced.
    pub(crate) fn publish_event(&self, event: Event) {
        if self.event_tx.send(event).is_err() {
            tracing::error!("event queue is gone, dropping event");
        }
    }
}

impl Node {
    pub(crate) fn node_ref(&self) -> common::events::NodeRef {
        common::events::NodeRef {
            space_id: self.space_id.clone(),
            node_id: self.id.clone(),
        }
    }
}
