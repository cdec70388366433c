//! Tree assimilation and id-cache warmup
//!
//! Filesystem events (from an external watcher or explicit calls) are fed
//! into `Tree::scan`, debounced per path and processed by a bounded worker
//! pool. Assimilation reconciles an on-disk entry with the metadata layer:
//! it ends up with a stable id, a correct parent, fresh checksums and a
//! cached path, tolerating out-of-band creates, moves and deletes.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use uuid::Uuid;

use common::attrs::{self, Attributes, NodeType};
use common::events::{Event, UserId};
use common::{Error, Result};

use crate::node::{self, Node, CURRENT_SUFFIX, REVISION_DELIMITER};
use crate::tree::Tree;

/// Filesystem event category fed into the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Update,
    Move,
    MoveFrom,
    Delete,
}

/// A coalescable scan request for one path.
#[derive(Debug, Clone)]
pub struct ScanItem {
    pub path: PathBuf,
    pub force_rescan: bool,
    pub recurse: bool,
}

struct PendingScan {
    item: ScanItem,
    fire_at: Instant,
}

#[derive(Default)]
pub(crate) struct DebounceState {
    pending: StdMutex<HashMap<PathBuf, PendingScan>>,
    in_progress: StdMutex<HashSet<PathBuf>>,
}

impl DebounceState {
    fn begin(&self, path: &Path) {
        self.in_progress.lock().unwrap().insert(path.to_path_buf());
    }

    pub(crate) fn finish(&self, path: &Path) {
        self.in_progress.lock().unwrap().remove(path);
    }
}

/// Coalesces scan requests per path.
///
/// A second request for the same path within the window merges into the
/// first (`force_rescan` and `recurse` are OR-ed) and restarts the timer.
/// A path never runs concurrently with itself: if it is still being
/// processed when the timer fires, the run is rescheduled.
pub struct ScanDebouncer {
    after: Duration,
    tx: mpsc::UnboundedSender<ScanItem>,
    state: Arc<DebounceState>,
}

impl ScanDebouncer {
    pub fn new(after: Duration, tx: mpsc::UnboundedSender<ScanItem>) -> Self {
        Self {
            after,
            tx,
            state: Arc::new(DebounceState::default()),
        }
    }

    pub fn debounce(&self, item: ScanItem) {
        if self.after.is_zero() {
            self.state.begin(&item.path);
            let _ = self.tx.send(item);
            return;
        }

        let path = item.path.clone();
        let mut pending = self.state.pending.lock().unwrap();
        if let Some(existing) = pending.get_mut(&path) {
            existing.item.force_rescan |= item.force_rescan;
            existing.item.recurse |= item.recurse;
            existing.fire_at = Instant::now() + self.after;
            return;
        }
        pending.insert(
            path.clone(),
            PendingScan {
                item,
                fire_at: Instant::now() + self.after,
            },
        );
        drop(pending);
        self.spawn_timer(path);
    }

    fn spawn_timer(&self, path: PathBuf) {
        let state = self.state.clone();
        let tx = self.tx.clone();
        let after = self.after;
        tokio::spawn(async move {
            loop {
                let fire_at = match state.pending.lock().unwrap().get(&path) {
                    Some(pending) => pending.fire_at,
                    None => return,
                };
                let now = Instant::now();
                if fire_at > now {
                    tokio::time::sleep(fire_at - now).await;
                    continue;
                }

                if state.in_progress.lock().unwrap().contains(&path) {
                    // previous run on this path still active, come back later
                    if let Some(pending) = state.pending.lock().unwrap().get_mut(&path) {
                        pending.fire_at = Instant::now() + after;
                    }
                    continue;
                }

                let item = match state.pending.lock().unwrap().remove(&path) {
                    Some(pending) => pending.item,
                    None => return,
                };
                state.begin(&path);
                let _ = tx.send(item);
                return;
            }
        });
    }

    /// True while the path is pending or actively being processed.
    pub fn in_progress(&self, path: &Path) -> bool {
        if self.state.pending.lock().unwrap().contains_key(path) {
            return true;
        }
        self.state.in_progress.lock().unwrap().contains(path)
    }

    /// True when no path is pending or being processed.
    pub fn is_idle(&self) -> bool {
        self.state.pending.lock().unwrap().is_empty()
            && self.state.in_progress.lock().unwrap().is_empty()
    }

    pub(crate) fn state(&self) -> Arc<DebounceState> {
        self.state.clone()
    }
}

impl Tree {
    /// Spawn the scan worker pool. Must be called once after construction
    /// when scanning is used.
    pub async fn start_scan_workers(self: &Arc<Self>) {
        let rx = self.scan_rx.lock().await.take();
        let Some(rx) = rx else {
            return;
        };
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..self.options.max_concurrency.max(1) {
            let tree = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(item) = item else { break };
                    tree.process_scan_item(item).await;
                }
            });
        }
    }

    async fn process_scan_item(self: &Arc<Self>, item: ScanItem) {
        let path = item.path.clone();
        let recurse = item.recurse;
        match self.assimilate(item).await {
            Err(e) => {
                tracing::error!("failed to assimilate {}: {}", path.display(), e);
            }
            Ok(()) if recurse => {
                if let Err(e) = self.warmup_id_cache(&path, true, false).await {
                    tracing::error!("failed to warmup id cache for {}: {}", path.display(), e);
                }
            }
            Ok(()) => {}
        }
        self.debouncer.state().finish(&path);
    }

    /// Map a filesystem event to debounced scan work.
    pub async fn scan(self: &Arc<Self>, path: &Path, action: EventAction, is_dir: bool) -> Result<()> {
        let parent = parent_of(path)?;
        match action {
            EventAction::Create => {
                tracing::debug!("scanning path {} (create, dir={})", path.display(), is_dir);
                if !is_dir {
                    // new file, possibly part of a new directory: assimilate
                    // it and rescan the parent to catch entries without events
                    if !self.debouncer.in_progress(&parent) {
                        self.debouncer.debounce(ScanItem {
                            path: path.to_path_buf(),
                            force_rescan: false,
                            recurse: false,
                        });
                    }
                    self.set_dirty(&parent, true).await?;
                    self.debouncer.debounce(ScanItem {
                        path: parent,
                        force_rescan: true,
                        recurse: true,
                    });
                } else {
                    self.set_dirty(path, true).await?;
                    self.debouncer.debounce(ScanItem {
                        path: path.to_path_buf(),
                        force_rescan: true,
                        recurse: true,
                    });
                }
            }
            EventAction::Update => {
                tracing::debug!("scanning path {} (update)", path.display());
                // skip when the parent rescan will pick the change up anyway
                if !self.debouncer.in_progress(&parent) {
                    self.debouncer.debounce(ScanItem {
                        path: path.to_path_buf(),
                        force_rescan: true,
                        recurse: false,
                    });
                }
            }
            EventAction::Move => {
                tracing::debug!("scanning path {} (move, dir={})", path.display(), is_dir);
                self.debouncer.debounce(ScanItem {
                    path: path.to_path_buf(),
                    force_rescan: is_dir,
                    recurse: is_dir,
                });
            }
            EventAction::MoveFrom => {
                tracing::debug!("scanning path {} (move from)", path.display());
                self.set_dirty(&parent, true).await?;
                let tree = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = tree.warmup_id_cache(&parent, false, true).await {
                        tracing::error!(
                            "failed to warmup id cache for {}: {}",
                            parent.display(),
                            e
                        );
                    }
                });
            }
            EventAction::Delete => {
                tracing::debug!("handling deleted item {}", path.display());
                self.handle_file_delete(path).await?;
                self.debouncer.debounce(ScanItem {
                    path: parent,
                    force_rescan: true,
                    recurse: true,
                });
            }
        }
        Ok(())
    }

    /// Drop cache and metadata for a path removed out-of-band and notify
    /// downstream consumers.
    pub async fn handle_file_delete(&self, path: &Path) -> Result<()> {
        let (space_id, id) = match self.lookup.id_cache().get_by_path(path).await {
            Some(ids) => ids,
            None => self.lookup.ids_for_path(path).await?,
        };

        self.lookup.id_cache().delete_by_path(path).await;
        if let Err(e) = self.lookup.metadata_backend().purge(path).await {
            tracing::error!("could not purge metadata of {}: {}", path.display(), e);
        }

        let parent = parent_of(path)?;
        let (parent_space, parent_id) = self.lookup.ids_for_path(&parent).await?;
        let parent_node = Node::read(&self.lookup, &parent_space, &parent_id).await?;
        let owner = parent_node.owner(&self.lookup).await.unwrap_or_default();
        self.publish_event(Event::ItemTrashed {
            owner,
            node: common::events::NodeRef {
                space_id,
                node_id: id,
            },
            key: String::new(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Resolve the space a path belongs to by walking ancestors until an
    /// xattr-tagged space root is found; scope the effective ids when
    /// space groups are enabled.
    async fn find_space(&self, path: &Path) -> Result<(String, Attributes)> {
        let backend = self.lookup.metadata_backend();
        let mut candidate = path.to_path_buf();
        while candidate.starts_with(&self.options.root) && candidate != self.options.root {
            match backend.identify_path(&candidate).await {
                Ok(identity) => {
                    if let Some(space_id) = identity.space_id {
                        if self.options.use_space_groups {
                            let meta = tokio::fs::metadata(&candidate).await?;
                            let gid = unix_gid(&meta);
                            self.usermapper.scope_user_by_ids(-1, gid).await?;
                        }
                        let space_attrs = backend.all(&candidate).await?;
                        return Ok((space_id, space_attrs));
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            candidate = match candidate.parent() {
                Some(p) => p.to_path_buf(),
                None => break,
            };
        }
        Err(Error::NotFound(format!(
            "could not find space for path {}",
            path.display()
        )))
    }

    /// Reconcile an on-disk entry with the metadata layer.
    ///
    /// Idempotent and always re-runnable; concurrent runs on the same path
    /// are excluded by the metadata lock.
    pub fn assimilate<'a>(
        self: &'a Arc<Self>,
        item: ScanItem,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.assimilate_inner(item))
    }

    async fn assimilate_inner(self: &Arc<Self>, item: ScanItem) -> Result<()> {
        let (space_id, space_attrs) = self.find_space(&item.path).await?;
        let backend = self.lookup.metadata_backend();

        let _lock = backend.lock(&item.path).await?;

        let user = UserId {
            idp: space_attrs.string(attrs::OWNER_IDP_ATTR).unwrap_or_default(),
            opaque_id: space_attrs.string(attrs::OWNER_ID_ATTR).unwrap_or_default(),
        };

        // re-check after grabbing the lock, the entry may have been
        // assimilated in the meantime
        let identity = backend.identify_path(&item.path).await?;

        if let Some(id) = identity.id {
            let previous_path = self.lookup.get_cached_id(&space_id, &id).await;
            // after a move the old path is gone; the entry itself still
            // carries its pre-move parent in that case
            let mut previous_parent_id = None;
            if let Some(prev) = &previous_path {
                previous_parent_id = backend
                    .get(prev, attrs::PARENTID_ATTR)
                    .await
                    .ok()
                    .map(|v| String::from_utf8_lossy(&v).into_owned());
                if previous_parent_id.is_none() {
                    previous_parent_id = backend
                        .get(&item.path, attrs::PARENTID_ATTR)
                        .await
                        .ok()
                        .map(|v| String::from_utf8_lossy(&v).into_owned());
                }
            }

            let fs_meta = tokio::fs::metadata(&item.path).await?;
            if previous_path.as_deref() == Some(item.path.as_path()) {
                if let (Some(xattr_mtime), Ok(fs_mtime)) = (identity.mtime, fs_meta.modified()) {
                    if xattr_mtime == DateTime::<Utc>::from(fs_mtime) {
                        // handled by us already
                        return Ok(());
                    }
                }
            }

            match (previous_path, previous_parent_id) {
                (Some(previous_path), Some(previous_parent_id))
                    if !previous_parent_id.is_empty() && previous_path != item.path =>
                {
                    if tokio::fs::metadata(&previous_path).await.is_ok() {
                        // the id clashes with an existing item (e.g. after a
                        // cp --preserve=xattr): clear metadata and
                        // re-assimilate with a fresh id
                        tracing::debug!(
                            "id clash detected at {}, purging metadata and re-assimilating",
                            item.path.display()
                        );
                        backend.purge(&item.path).await?;
                        let tree = self.clone();
                        let path = item.path.clone();
                        tokio::spawn(async move {
                            let retry = ScanItem {
                                path: path.clone(),
                                force_rescan: true,
                                recurse: false,
                            };
                            if let Err(e) = Box::pin(tree.assimilate(retry)).await {
                                tracing::error!(
                                    "could not re-assimilate {}: {}",
                                    path.display(),
                                    e
                                );
                            }
                        });
                    } else {
                        tracing::debug!("move detected at {}", item.path.display());
                        self.lookup.cache_id(&space_id, &id, &item.path).await;
                        let (_, updated_attrs) =
                            self.update_file(&item.path, &id, &space_id).await?;
                        self.lookup.id_cache().delete_path(&previous_path).await;

                        if fs_meta.is_dir() {
                            let tree = self.clone();
                            let path = item.path.clone();
                            tokio::spawn(async move {
                                if let Err(e) = tree.warmup_id_cache(&path, false, true).await {
                                    tracing::error!(
                                        "could not warmup id cache for {}: {}",
                                        path.display(),
                                        e
                                    );
                                }
                            });
                        }

                        let parent_id = updated_attrs
                            .string(attrs::PARENTID_ATTR)
                            .unwrap_or_default();
                        if !parent_id.is_empty() {
                            self.publish_event(Event::ItemMoved {
                                owner: user,
                                node: common::events::NodeRef {
                                    space_id: space_id.clone(),
                                    node_id: id.clone(),
                                },
                                parent_id,
                                previous_parent_id,
                                name: base_name(&item.path),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                }
                _ => {
                    // known item, same location: refresh the cached path and
                    // the metadata
                    tracing::debug!("updating cached path for {}", item.path.display());
                    self.lookup.cache_id(&space_id, &id, &item.path).await;
                    self.update_file(&item.path, &id, &space_id).await?;
                }
            }
        } else {
            tracing::debug!("new item detected at {}", item.path.display());
            let new_id = Uuid::new_v4().to_string();
            let (fs_meta, _) = self.update_file(&item.path, &new_id, &space_id).await?;

            let node_ref = common::events::NodeRef {
                space_id: space_id.clone(),
                node_id: new_id,
            };
            if fs_meta.is_dir() {
                self.publish_event(Event::ContainerCreated {
                    owner: user,
                    node: node_ref,
                    timestamp: Utc::now(),
                });
            } else if fs_meta.len() == 0 {
                self.publish_event(Event::FileTouched {
                    owner: user,
                    node: node_ref,
                    timestamp: Utc::now(),
                });
            } else {
                self.publish_event(Event::UploadReady {
                    owner: user,
                    node: node_ref,
                    filename: base_name(&item.path),
                    timestamp: Utc::now(),
                });
            }
        }
        Ok(())
    }

    /// Write the full attribute set for an entry: parent linkage, checksums,
    /// type, blob reference, mtime. Assimilates the parent first if it has
    /// no metadata yet (one retry).
    pub(crate) async fn update_file(
        self: &Arc<Self>,
        path: &Path,
        id: &str,
        space_id: &str,
    ) -> Result<(std::fs::Metadata, Attributes)> {
        let backend = self.lookup.metadata_backend();
        let mut retries = 1;

        let parent_id = loop {
            if id == space_id {
                break String::new();
            }
            let parent = parent_of(path)?;
            let parent_attrs = match backend.all(&parent).await {
                Ok(a) => a,
                Err(e) if e.is_not_found() => Attributes::new(),
                Err(e) => return Err(e),
            };
            match parent_attrs.string(attrs::ID_ATTR) {
                Some(parent_id) if !parent_id.is_empty() => break parent_id,
                _ => {
                    if retries == 0 {
                        return Err(Error::Internal(format!(
                            "got empty parent attributes for {} even after assimilating",
                            parent.display()
                        )));
                    }
                    retries -= 1;
                    Box::pin(self.assimilate(ScanItem {
                        path: parent,
                        force_rescan: false,
                        recurse: false,
                    }))
                    .await?;
                }
            }
        };

        let fs_meta = tokio::fs::metadata(path).await?;
        let previous_attrs = match backend.all(path).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => Attributes::new(),
            Err(e) => return Err(e),
        };

        let mut attributes = Attributes::new();
        attributes.set_string(attrs::ID_ATTR, id);
        attributes.set_string(attrs::NAME_ATTR, &base_name(path));
        if !parent_id.is_empty() {
            attributes.set_string(attrs::PARENTID_ATTR, &parent_id);
        }

        if !fs_meta.is_dir() {
            if let Ok(sums) = node::calculate_checksums(path).await {
                attributes.set(&format!("{}sha1", attrs::CHECKSUM_PREFIX), sums.sha1);
                attributes.set(&format!("{}md5", attrs::CHECKSUM_PREFIX), sums.md5);
                attributes.set(&format!("{}adler32", attrs::CHECKSUM_PREFIX), sums.adler32);
            }
        }

        let node = if fs_meta.is_dir() {
            attributes.set_i64(attrs::TYPE_ATTR, NodeType::Container as i64);
            let tree_size = previous_attrs.i64(attrs::TREESIZE_ATTR).unwrap_or(0);
            attributes.set_i64(attrs::TREESIZE_ATTR, tree_size);
            attributes.set_string(attrs::PROPAGATION_ATTR, "1");
            Node {
                space_id: space_id.to_string(),
                id: id.to_string(),
                parent_id: parent_id.clone(),
                name: base_name(path),
                blob_id: None,
                blobsize: tree_size,
                node_type: NodeType::Container,
                path: path.to_path_buf(),
                exists: true,
            }
        } else {
            let blob_id = Uuid::new_v4().to_string();
            attributes.set_string(attrs::BLOBID_ATTR, &blob_id);
            attributes.set_i64(attrs::BLOBSIZE_ATTR, fs_meta.len() as i64);
            attributes.set_i64(attrs::TYPE_ATTR, NodeType::File as i64);
            Node {
                space_id: space_id.to_string(),
                id: id.to_string(),
                parent_id: parent_id.clone(),
                name: base_name(path),
                blob_id: Some(blob_id),
                blobsize: fs_meta.len() as i64,
                node_type: NodeType::File,
                path: path.to_path_buf(),
                exists: true,
            }
        };
        let fs_mtime = fs_meta.modified()?;
        attributes.set_time(attrs::MTIME_ATTR, DateTime::<Utc>::from(fs_mtime));

        if !fs_meta.is_dir() {
            // preserve the previous content as a revision; out-of-band
            // writes would otherwise lose history
            let tree = self.clone();
            let replica = node.clone();
            tokio::spawn(async move {
                tree.replicate_current(&replica).await;
            });
        }

        self.propagate(&node, 0).await?;

        tracing::debug!("setting attributes on {}", path.display());
        backend.set_multiple(path, &attributes, false).await?;

        self.lookup.cache_id(space_id, id, path).await;

        Ok((fs_meta, attributes))
    }

    /// Move the stale current-content copy aside as a revision timestamped
    /// with its mtime, then refresh the copy from the live file. Failures
    /// are logged; the main update is never rolled back.
    async fn replicate_current(&self, node: &Node) {
        let current_path = node.current_path();
        match tokio::fs::metadata(&current_path).await {
            Ok(stat) => {
                let Ok(modified) = stat.modified() else {
                    return;
                };
                let timestamp = attrs::format_time(DateTime::<Utc>::from(modified));
                let revision_path = match self
                    .lookup
                    .version_path(&node.space_id, &node.id, &timestamp)
                    .await
                {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(
                            "could not compute revision path for {}: {}",
                            node.path.display(),
                            e
                        );
                        return;
                    }
                };
                if let Err(e) = tokio::fs::rename(&current_path, &revision_path).await {
                    tracing::error!(
                        "could not create revision {}: {}",
                        revision_path.display(),
                        e
                    );
                    return;
                }
            }
            Err(_) => {
                tracing::debug!(
                    "no current copy for {} yet, seeding it",
                    node.path.display()
                );
            }
        }

        if let Err(e) = tokio::fs::copy(&node.path, &current_path).await {
            tracing::error!(
                "could not copy new version to current copy {}: {}",
                current_path.display(),
                e
            );
            return;
        }
        if let Err(e) = self
            .lookup
            .copy_metadata(
                &node.path,
                &current_path,
                crate::lookup::blob_attribute_filter(false),
                false,
            )
            .await
        {
            tracing::error!(
                "failed to copy xattrs to current copy {}: {}",
                current_path.display(),
                e
            );
        }
    }

    /// Walk the tree under `root`, rebuilding the id cache and the
    /// accumulated tree sizes. With `only_dirty`, clean subtrees are pruned;
    /// with `assimilate`, entries without an id are assimilated on the spot.
    pub async fn warmup_id_cache(
        self: &Arc<Self>,
        root: &Path,
        assimilate: bool,
        only_dirty: bool,
    ) -> Result<()> {
        let backend = self.lookup.metadata_backend();
        let mut sizes: HashMap<PathBuf, i64> = HashMap::new();
        let upload_dir = self.options.upload_dir();

        if is_trash(root) || root == upload_dir {
            return Ok(());
        }
        if only_dirty && !self.is_dirty(root).await.unwrap_or(true) {
            return Ok(());
        }

        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            sizes.entry(dir.clone()).or_insert(0);

            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!("could not read directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if is_internal(&path) || is_lock_file(&path) || backend.is_meta_file(&path) {
                    continue;
                }
                if is_trash(&path) || path == upload_dir {
                    continue;
                }
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };

                if meta.is_dir() {
                    if only_dirty && !self.is_dirty(&path).await.unwrap_or(true) {
                        // pruned subtree: its stored size still counts
                        // towards the ancestors
                        let tree_size = backend
                            .get_i64(&path, attrs::TREESIZE_ATTR)
                            .await
                            .unwrap_or(0);
                        accumulate_into_ancestors(&mut sizes, &path, root, tree_size);
                        continue;
                    }
                    stack.push(path.clone());
                } else {
                    accumulate_into_ancestors(&mut sizes, &path, root, meta.len() as i64);
                    self.warmup_entry(&path, assimilate).await;
                    if let Err(e) = self.set_dirty(&path, false).await {
                        tracing::error!(
                            "could not clear dirty flag of {}: {}",
                            path.display(),
                            e
                        );
                    }
                }
            }

            self.warmup_entry(&dir, assimilate).await;
            if let Err(e) = self.set_dirty(&dir, false).await {
                tracing::error!("could not clear dirty flag of {}: {}", dir.display(), e);
            }
        }

        let root_path = root.to_path_buf();
        for (dir, size) in sizes {
            let (space_id, id) = match self.lookup.ids_for_path(&dir).await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!("could not get ids for {}: {}", dir.display(), e);
                    continue;
                }
            };
            let dir_node = match Node::read(&self.lookup, &space_id, &id).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("could not read directory node {}: {}", dir.display(), e);
                    continue;
                }
            };
            if dir == root_path {
                // carry the size change beyond the walk root
                if let Err(e) = self.propagate_size_diff(&dir_node, size).await {
                    tracing::error!(
                        "could not propagate size diff for {}: {}",
                        dir.display(),
                        e
                    );
                }
            }
            if let Err(e) = backend
                .set(&dir, attrs::TREESIZE_ATTR, size.to_string().as_bytes())
                .await
            {
                tracing::error!("could not set tree size of {}: {}", dir.display(), e);
            }
        }

        Ok(())
    }

    /// Cache or repair the id binding of a single walked entry.
    async fn warmup_entry(self: &Arc<Self>, path: &Path, assimilate: bool) {
        let backend = self.lookup.metadata_backend();
        match backend.identify_path(path).await {
            Ok(identity) if identity.id.is_some() => {
                let id = identity.id.unwrap();
                let space_id = match identity.space_id {
                    Some(space_id) => space_id,
                    None => match self.lookup.ids_for_path(path).await {
                        Ok((space_id, _)) => space_id,
                        Err(_) => return,
                    },
                };
                // an existing file at the previously cached path means this
                // is a copy carrying a foreign id
                if let Some(previous_path) = self.lookup.get_cached_id(&space_id, &id).await {
                    if previous_path != path
                        && tokio::fs::metadata(&previous_path).await.is_ok()
                    {
                        let _ = Box::pin(self.assimilate(ScanItem {
                            path: path.to_path_buf(),
                            force_rescan: true,
                            recurse: false,
                        }))
                        .await;
                        return;
                    }
                }
                self.lookup.cache_id(&space_id, &id, path).await;
            }
            _ if assimilate => {
                if let Err(e) = Box::pin(self.assimilate(ScanItem {
                    path: path.to_path_buf(),
                    force_rescan: true,
                    recurse: false,
                }))
                .await
                {
                    tracing::error!("could not assimilate {}: {}", path.display(), e);
                }
            }
            _ => {}
        }
    }

    async fn propagate_size_diff(&self, node: &Node, size: i64) -> Result<()> {
        let old_size = self
            .lookup
            .metadata_backend()
            .get_i64(&node.path, attrs::TREESIZE_ATTR)
            .await
            .unwrap_or(0);
        self.propagate(node, size - old_size).await
    }

    pub(crate) async fn set_dirty(&self, path: &Path, dirty: bool) -> Result<()> {
        self.lookup
            .metadata_backend()
            .set(
                path,
                attrs::DIRTY_ATTR,
                if dirty { b"true" } else { b"false" },
            )
            .await
    }

    pub(crate) async fn is_dirty(&self, path: &Path) -> Result<bool> {
        match self.lookup.metadata_backend().get(path, attrs::DIRTY_ATTR).await {
            Ok(raw) => Ok(raw == b"true"),
            // unknown entries count as dirty
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Wait until all debounced scans have drained. Intended for shutdown
    /// and tests.
    pub async fn wait_for_scan_idle(&self) {
        while !self.debouncer.is_idle() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn unix_gid(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.gid() as i64
}

fn accumulate_into_ancestors(
    sizes: &mut HashMap<PathBuf, i64>,
    path: &Path,
    root: &Path,
    size: i64,
) {
    let mut ancestor = path.to_path_buf();
    while ancestor != *root {
        ancestor = match ancestor.parent() {
            Some(p) => p.to_path_buf(),
            None => break,
        };
        *sizes.entry(ancestor.clone()).or_insert(0) += size;
    }
}

fn parent_of(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| Error::InvalidPath(path.display().to_string()))
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Engine-internal sidecars that never become nodes.
fn is_internal(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.contains(REVISION_DELIMITER) || name.ends_with(CURRENT_SUFFIX)
}

fn is_lock_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.ends_with(".mlock") || name.ends_with(".flock")
}

fn is_trash(path: &Path) -> bool {
    path.file_name()
        .map(|n| n == ".Trash")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, force: bool, recurse: bool) -> ScanItem {
        ScanItem {
            path: PathBuf::from(path),
            force_rescan: force,
            recurse,
        }
    }

    #[tokio::test]
    async fn test_debounce_coalesces_and_merges_flags() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let debouncer = ScanDebouncer::new(Duration::from_millis(20), tx);

        debouncer.debounce(item("/s/a", false, false));
        debouncer.debounce(item("/s/a", true, false));
        debouncer.debounce(item("/s/a", false, true));
        assert!(debouncer.in_progress(Path::new("/s/a")));

        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.path, PathBuf::from("/s/a"));
        assert!(fired.force_rescan);
        assert!(fired.recurse);

        // still in progress until the worker reports back
        assert!(debouncer.in_progress(Path::new("/s/a")));
        debouncer.state().finish(Path::new("/s/a"));
        assert!(!debouncer.in_progress(Path::new("/s/a")));
        assert!(debouncer.is_idle());

        // only one item was produced
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_debounce_requeues_while_processing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let debouncer = ScanDebouncer::new(Duration::from_millis(10), tx);

        debouncer.debounce(item("/s/a", false, false));
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.path, PathBuf::from("/s/a"));

        // path is processing; a new request must not fire concurrently
        debouncer.debounce(item("/s/a", true, false));
        assert!(
            tokio::time::timeout(Duration::from_millis(60), rx.recv())
                .await
                .is_err(),
            "item fired while the path was still processing"
        );

        debouncer.state().finish(Path::new("/s/a"));
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(second.force_rescan);
    }

    #[tokio::test]
    async fn test_zero_delay_fires_inline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let debouncer = ScanDebouncer::new(Duration::ZERO, tx);
        debouncer.debounce(item("/s/b", true, true));
        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.path, PathBuf::from("/s/b"));
        assert!(debouncer.in_progress(Path::new("/s/b")));
    }

    #[test]
    fn test_internal_path_detection() {
        assert!(is_internal(Path::new(
            "/s/a/f.REV.2024-06-01T08:00:00.000000000Z"
        )));
        assert!(is_internal(Path::new("/s/a/f.CURRENT")));
        assert!(is_lock_file(Path::new("/s/a/f.mlock")));
        assert!(is_trash(Path::new("/s/.Trash")));
        assert!(!is_internal(Path::new("/s/a/f")));
    }
}
