//! Upload session store
//!
//! Resumable uploads are persisted as `<uploads>/<id>.info` (a JSON session
//! descriptor) plus `<uploads>/<id>.bin` (the partial payload). The store
//! creates or updates the target node with optimistic concurrency checks
//! (`If-Match`, `If-None-Match`, `If-Unmodified-Since`), quota enforcement
//! and revision creation on overwrite.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use common::attrs::{self, Attributes, NodeType};
use common::events::Event;
use common::{Error, Result};
use metadata::LockedFile;

use crate::node::{self, Node, REVISION_DELIMITER};
use crate::tree::Tree;

const META_FILENAME: &str = "filename";
const META_SPACE_ID: &str = "spaceid";
const META_NODE_ID: &str = "nodeid";
const META_PARENT_ID: &str = "nodeparentid";
const META_NODE_EXISTS: &str = "nodeexists";
const META_IF_MATCH: &str = "if-match";
const META_IF_NONE_MATCH: &str = "if-none-match";
const META_IF_UNMODIFIED_SINCE: &str = "if-unmodified-since";
const META_MTIME: &str = "mtime";
const META_SIZE_DIFF: &str = "sizeDiff";
const META_VERSION_ID: &str = "versionID";
const META_OLD_MTIME: &str = "oldMtime";

/// Persisted session descriptor, tus `FileInfo` compatible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Size")]
    pub size: i64,
    #[serde(rename = "Offset")]
    pub offset: i64,
    #[serde(rename = "MetaData", default)]
    pub meta_data: HashMap<String, String>,
    #[serde(rename = "Storage", default)]
    pub storage: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub info: SessionInfo,
}

impl UploadSession {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn size(&self) -> i64 {
        self.info.size
    }

    pub fn set_size(&mut self, size: i64) {
        self.info.size = size;
    }

    fn meta(&self, key: &str) -> Option<&str> {
        self.info.meta_data.get(key).map(|s| s.as_str())
    }

    fn set_meta(&mut self, key: &str, value: String) {
        self.info.meta_data.insert(key.to_string(), value);
    }

    pub fn space_id(&self) -> String {
        self.meta(META_SPACE_ID).unwrap_or_default().to_string()
    }

    pub fn node_id(&self) -> Option<String> {
        self.meta(META_NODE_ID).map(|s| s.to_string())
    }

    pub fn node_parent_id(&self) -> String {
        self.meta(META_PARENT_ID).unwrap_or_default().to_string()
    }

    pub fn filename(&self) -> String {
        self.meta(META_FILENAME).unwrap_or_default().to_string()
    }

    pub fn node_exists(&self) -> bool {
        self.meta(META_NODE_EXISTS) == Some("true")
    }

    pub fn header_if_match(&self) -> Option<&str> {
        self.meta(META_IF_MATCH)
    }

    pub fn header_if_none_match(&self) -> Option<&str> {
        self.meta(META_IF_NONE_MATCH)
    }

    pub fn header_if_unmodified_since(&self) -> Option<&str> {
        self.meta(META_IF_UNMODIFIED_SINCE)
    }

    /// Client-requested mtime override.
    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        self.meta(META_MTIME)
            .and_then(|raw| attrs::parse_time(raw).ok())
    }

    pub fn size_diff(&self) -> i64 {
        self.meta(META_SIZE_DIFF)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    pub fn version_id(&self) -> Option<&str> {
        self.meta(META_VERSION_ID)
    }

    /// Bind the session to its target node.
    pub fn set_node(
        &mut self,
        space_id: &str,
        node_id: Option<&str>,
        parent_id: &str,
        filename: &str,
        node_exists: bool,
    ) {
        self.set_meta(META_SPACE_ID, space_id.to_string());
        if let Some(node_id) = node_id {
            self.set_meta(META_NODE_ID, node_id.to_string());
        }
        self.set_meta(META_PARENT_ID, parent_id.to_string());
        self.set_meta(META_FILENAME, filename.to_string());
        self.set_meta(META_NODE_EXISTS, node_exists.to_string());
    }

    pub fn set_header_if_match(&mut self, value: &str) {
        self.set_meta(META_IF_MATCH, value.to_string());
    }

    pub fn set_header_if_none_match(&mut self, value: &str) {
        self.set_meta(META_IF_NONE_MATCH, value.to_string());
    }

    pub fn set_header_if_unmodified_since(&mut self, value: &str) {
        self.set_meta(META_IF_UNMODIFIED_SINCE, value.to_string());
    }

    pub fn set_mtime(&mut self, mtime: DateTime<Utc>) {
        self.set_meta(META_MTIME, attrs::format_time(mtime));
    }
}

pub struct UploadStore {
    tree: Arc<Tree>,
    root: PathBuf,
    disable_versioning: bool,
}

impl UploadStore {
    pub fn new(tree: Arc<Tree>) -> Self {
        let options = tree.lookup().options();
        let root = options.upload_dir();
        let disable_versioning = options.disable_versioning;
        Self {
            tree,
            root,
            disable_versioning,
        }
    }

    fn info_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.info", id))
    }

    fn bin_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.bin", id))
    }

    /// Start a fresh session.
    pub fn new_session(&self) -> UploadSession {
        let mut storage = HashMap::new();
        storage.insert("Type".to_string(), "posixfsstore".to_string());
        UploadSession {
            info: SessionInfo {
                id: Uuid::new_v4().to_string(),
                size: 0,
                offset: 0,
                meta_data: HashMap::new(),
                storage,
            },
        }
    }

    /// Load a session by id. The offset is always recomputed from the
    /// payload file. Stale NFS handles and missing files map to `NotFound`.
    pub async fn get(&self, id: &str) -> Result<UploadSession> {
        if id.is_empty() || id.contains('/') {
            return Err(Error::NotFound(id.to_string()));
        }

        let data = match tokio::fs::read(self.info_path(id)).await {
            Ok(data) => data,
            Err(e) => return Err(map_session_io_error(e, id)),
        };
        let info: SessionInfo = serde_json::from_slice(&data)
            .map_err(|e| Error::Internal(format!("invalid session descriptor {}: {}", id, e)))?;
        let mut session = UploadSession { info };

        let stat = match tokio::fs::metadata(self.bin_path(id)).await {
            Ok(stat) => stat,
            Err(e) => return Err(map_session_io_error(e, id)),
        };
        session.info.offset = stat.len() as i64;
        Ok(session)
    }

    /// List all persisted sessions.
    pub async fn list(&self) -> Result<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".info") else {
                continue;
            };
            match self.get(id).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::error!("could not load upload session {}: {}", id, e);
                }
            }
        }
        Ok(sessions)
    }

    /// Write the session descriptor, in the base user scope.
    pub async fn persist(&self, session: &UploadSession) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let data = serde_json::to_vec(&session.info)
            .map_err(|e| Error::Internal(format!("failed to encode session: {}", e)))?;
        let path = self.info_path(session.id());
        self.tree
            .usermapper
            .run_in_base_scope(Box::pin(async move {
                tokio::fs::write(&path, &data).await?;
                Ok(())
            }))
            .await
    }

    /// Append a chunk to the payload, returning the new offset.
    pub async fn write_chunk(
        &self,
        session: &mut UploadSession,
        data: bytes::Bytes,
    ) -> Result<i64> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.bin_path(session.id());
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&data).await?;
        file.flush().await?;
        let offset = file.metadata().await?.len() as i64;
        session.info.offset = offset;
        Ok(offset)
    }

    /// Create or update the target node for the upload.
    ///
    /// For an overwrite the node metadata is write-locked, the quota and all
    /// preconditions are enforced and (unless versioning is disabled) the
    /// previous state is captured as a revision keyed by its mtime.
    pub async fn create_node_for_upload(
        &self,
        session: &mut UploadSession,
        mut init_attrs: Attributes,
    ) -> Result<Node> {
        let space_id = session.space_id();
        let node_id = match session.node_id() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                session.set_meta(META_NODE_ID, id.clone());
                id
            }
        };
        let parent_id = session.node_parent_id();
        let filename = session.filename();
        let parent_path = self.tree.lookup.internal_path(&space_id, &parent_id).await?;
        let path = parent_path.join(&filename);

        let node = Node {
            space_id: space_id.clone(),
            id: node_id.clone(),
            parent_id: parent_id.clone(),
            name: filename.clone(),
            blob_id: Some(session.id().to_string()),
            blobsize: session.size(),
            node_type: NodeType::File,
            path: path.clone(),
            exists: session.node_exists(),
        };

        let _guard: LockedFile = if session.node_exists() {
            self.update_existing_node(session, &node).await?
        } else {
            self.tree.lookup.cache_id(&space_id, &node_id, &path).await;
            let guard = self.tree.init_new_node(&node, session.size()).await?;
            session.set_meta(META_SIZE_DIFF, session.size().to_string());
            guard
        };

        // overwrite technical information
        init_attrs.set_string(attrs::ID_ATTR, &node.id);
        init_attrs.set_i64(attrs::TYPE_ATTR, NodeType::File as i64);
        init_attrs.set_string(attrs::PARENTID_ATTR, &node.parent_id);
        init_attrs.set_string(attrs::NAME_ATTR, &node.name);
        init_attrs.set_string(attrs::BLOBID_ATTR, session.id());
        init_attrs.set_i64(attrs::BLOBSIZE_ATTR, node.blobsize);
        init_attrs.set_string(
            attrs::STATUS_ATTR,
            &format!("{}{}", attrs::PROCESSING_STATUS, session.id()),
        );
        let mtime = session.mtime().unwrap_or_else(Utc::now);
        init_attrs.set_time(attrs::MTIME_ATTR, mtime);

        self.tree
            .lookup
            .metadata_backend()
            .set_multiple(&node.path, &init_attrs, false)
            .await?;

        self.persist(session).await?;
        Ok(node)
    }

    async fn update_existing_node(
        &self,
        session: &mut UploadSession,
        node: &Node,
    ) -> Result<LockedFile> {
        let backend = self.tree.lookup.metadata_backend();
        // write-lock the node before reading any metadata
        let guard = backend.lock(&node.path).await?;

        let old = Node::read(&self.tree.lookup, &node.space_id, &node.id).await?;
        if !old.exists {
            return Err(Error::NotFound(node.id.clone()));
        }
        let space_root_path = self.tree.lookup.space_root_path(&node.space_id);
        node::check_quota(backend, &space_root_path, old.blobsize, session.size()).await?;

        let old_mtime = old.mtime(backend).await?;
        let old_etag = node::calculate_etag(&old.id, old_mtime);

        if let Some(if_match) = session.header_if_match() {
            if if_match != old_etag {
                return Err(Error::Aborted("etag mismatch".to_string()));
            }
        }
        if let Some(if_none_match) = session.header_if_none_match() {
            if if_none_match == "*" {
                return Err(Error::Aborted("etag mismatch, resource exists".to_string()));
            }
            for tag in if_none_match.split(',') {
                if tag.trim() == old_etag {
                    return Err(Error::Aborted("etag mismatch".to_string()));
                }
            }
        }
        if let Some(if_unmodified_since) = session.header_if_unmodified_since() {
            let threshold = attrs::parse_time(if_unmodified_since).map_err(|e| {
                Error::Internal(format!("failed to parse if-unmodified-since time: {}", e))
            })?;
            if old_mtime > threshold {
                return Err(Error::Aborted("if-unmodified-since mismatch".to_string()));
            }
        }

        if !self.disable_versioning {
            let timestamp = attrs::format_time(old_mtime);
            let version_id = format!("{}{}{}", node.id, REVISION_DELIMITER, timestamp);
            let version_path = match self.tree.create_revision(&old, &timestamp, &guard).await {
                Ok(path) => path,
                Err(Error::AlreadyExists(_)) => {
                    // a revision with this mtime already exists; if the blobs
                    // match we replace it, otherwise somebody else's history
                    // would be overwritten
                    let existing = self
                        .tree
                        .lookup
                        .version_path(&node.space_id, &node.id, &timestamp)
                        .await?;
                    validate_checksums(backend, &old.path, &existing).await?;
                    self.tree.delete_blob(&existing).await?;
                    self.tree.create_revision(&old, &timestamp, &guard).await?
                }
                Err(e) => return Err(e),
            };

            session.set_meta(META_VERSION_ID, version_id);
            // the revision keeps the mtime of the state it captured
            let ft = FileTime::from_system_time(old_mtime.into());
            tokio::task::spawn_blocking(move || filetime::set_file_times(&version_path, ft, ft))
                .await
                .map_err(|e| Error::Internal(format!("chtimes task failed: {}", e)))?
                .map_err(|e| {
                    Error::Internal(format!("failed to change mtime of version: {}", e))
                })?;
        }

        session.set_meta(META_SIZE_DIFF, (session.size() - old.blobsize).to_string());
        session.set_meta(META_OLD_MTIME, attrs::format_time(old_mtime));
        Ok(guard)
    }

    /// Land the received payload on the node: move the bytes into place,
    /// persist checksums and final metadata, propagate the size change and
    /// announce the upload.
    pub async fn finalize(&self, session: &UploadSession) -> Result<Node> {
        let space_id = session.space_id();
        let node_id = session
            .node_id()
            .ok_or_else(|| Error::Internal("session has no node".to_string()))?;
        let node = Node::read(&self.tree.lookup, &space_id, &node_id).await?;
        let backend = self.tree.lookup.metadata_backend();

        let bin_path = self.bin_path(session.id());
        let written = self.tree.blobstore.write_blob(&node.path, &bin_path).await?;

        let sums = node::calculate_checksums(&node.path).await?;
        let mut final_attrs = Attributes::new();
        final_attrs.set(&format!("{}sha1", attrs::CHECKSUM_PREFIX), sums.sha1);
        final_attrs.set(&format!("{}md5", attrs::CHECKSUM_PREFIX), sums.md5);
        final_attrs.set(&format!("{}adler32", attrs::CHECKSUM_PREFIX), sums.adler32);
        final_attrs.set_i64(attrs::BLOBSIZE_ATTR, written as i64);
        backend.set_multiple(&node.path, &final_attrs, true).await?;

        // keep the filesystem mtime aligned with the metadata so the next
        // scan takes the fast path
        if let Ok(mtime) = node.mtime(backend).await {
            let ft = FileTime::from_system_time(mtime.into());
            let path = node.path.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_times(&path, ft, ft))
                .await
                .map_err(|e| Error::Internal(format!("chtimes task failed: {}", e)))?
                .map_err(|e| Error::Internal(format!("failed to set node mtime: {}", e)))?;
        }

        // seed/refresh the current-content copy used for out-of-band
        // change detection
        tokio::fs::copy(&node.path, node.current_path()).await?;
        self.tree
            .lookup
            .copy_metadata(
                &node.path,
                &node.current_path(),
                crate::lookup::blob_attribute_filter(false),
                false,
            )
            .await?;

        let mut updated = node.clone();
        updated.blobsize = written as i64;
        self.tree.propagate(&updated, session.size_diff()).await?;

        updated.unmark_processing(backend, session.id()).await?;

        let owner = updated.owner(&self.tree.lookup).await.unwrap_or_default();
        self.tree.publish_event(Event::UploadReady {
            owner,
            node: updated.node_ref(),
            filename: updated.name.clone(),
            timestamp: Utc::now(),
        });

        self.remove_session_files(session.id()).await;
        Ok(updated)
    }

    /// Remove session state and, as directed, revert node metadata or clear
    /// the processing marker so readers can download the node again.
    pub async fn cleanup(
        &self,
        session: &UploadSession,
        revert_node_metadata: bool,
        keep_upload: bool,
        unmark_postprocessing: bool,
    ) {
        if revert_node_metadata {
            if let Err(e) = self.revert_node_metadata(session).await {
                tracing::info!(
                    "could not revert node metadata for session {}: {}",
                    session.id(),
                    e
                );
            }
        }

        if !keep_upload {
            self.remove_session_files(session.id()).await;
        }

        if unmark_postprocessing {
            match self.session_node(session).await {
                Ok(Some(node)) => {
                    let backend = self.tree.lookup.metadata_backend();
                    if let Err(e) = node.unmark_processing(backend, session.id()).await {
                        tracing::info!(
                            "unmarking processing failed for {}: {}",
                            node.path.display(),
                            e
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::info!("could not read node of session {}: {}", session.id(), e);
                }
            }
        }
    }

    async fn session_node(&self, session: &UploadSession) -> Result<Option<Node>> {
        let Some(node_id) = session.node_id() else {
            return Ok(None);
        };
        let node = Node::read(&self.tree.lookup, &session.space_id(), &node_id).await?;
        Ok(node.exists.then_some(node))
    }

    async fn revert_node_metadata(&self, session: &UploadSession) -> Result<()> {
        let Some(node) = self.session_node(session).await? else {
            return Ok(());
        };
        let backend = self.tree.lookup.metadata_backend();
        if let Some(old_mtime) = session.info.meta_data.get(META_OLD_MTIME) {
            backend
                .set(&node.path, attrs::MTIME_ATTR, old_mtime.as_bytes())
                .await?;
        }
        Ok(())
    }

    async fn remove_session_files(&self, id: &str) {
        for path in [self.info_path(id), self.bin_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!("could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

async fn validate_checksums(
    backend: &dyn metadata::MetadataBackend,
    node_path: &Path,
    version_path: &Path,
) -> Result<()> {
    for algo in ["md5", "sha1", "adler32"] {
        let key = format!("{}{}", attrs::CHECKSUM_PREFIX, algo);
        let node_sum = backend.get(node_path, &key).await?;
        let version_sum = backend.get(version_path, &key).await?;
        if node_sum.is_empty() || version_sum.is_empty() {
            return Err(Error::Internal("checksum not found".to_string()));
        }
        if node_sum != version_sum {
            return Err(Error::AlreadyExists(format!(
                "revision {} exists with mismatching {} checksum",
                version_path.display(),
                algo
            )));
        }
    }
    Ok(())
}

fn map_session_io_error(e: std::io::Error, id: &str) -> Error {
    if e.raw_os_error() == Some(libc::ESTALE) {
        tracing::info!("treating stale file handle for session {} as not found", id);
        return Error::NotFound(id.to_string());
    }
    if e.kind() == std::io::ErrorKind::NotFound {
        return Error::NotFound(id.to_string());
    }
    Error::Io(e)
}
