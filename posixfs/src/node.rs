//! Node model
//!
//! In-memory view of a directory or file inside a space. All persistent
//! state lives in xattrs on the underlying path; a `Node` is a snapshot
//! loaded through the lookup layer.

use adler32::RollingAdler32;
use chrono::{DateTime, Utc};
use md5::Md5;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use common::attrs::{self, NodeType};
use common::events::UserId;
use common::{Error, Result};
use metadata::MetadataBackend;

use crate::lookup::Lookup;

/// Separator between a node's base name and a revision timestamp.
pub const REVISION_DELIMITER: &str = ".REV.";

/// Suffix of the sidecar holding a copy of the last content written through
/// the engine. Out-of-band writes are detected against it and the previous
/// content is preserved as a revision.
pub const CURRENT_SUFFIX: &str = ".CURRENT";

#[derive(Debug, Clone)]
pub struct Node {
    pub space_id: String,
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub blob_id: Option<String>,
    pub blobsize: i64,
    pub node_type: NodeType,
    pub path: PathBuf,
    pub exists: bool,
}

impl Node {
    /// Load a node by id. A missing path yields a node with `exists: false`.
    pub async fn read(lookup: &Lookup, space_id: &str, id: &str) -> Result<Node> {
        let path = lookup.internal_path(space_id, id).await?;
        let node_attrs = match lookup.metadata_backend().all(&path).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => {
                return Ok(Node {
                    space_id: space_id.to_string(),
                    id: id.to_string(),
                    parent_id: String::new(),
                    name: String::new(),
                    blob_id: None,
                    blobsize: 0,
                    node_type: NodeType::File,
                    path,
                    exists: false,
                })
            }
            Err(e) => return Err(e),
        };

        Ok(Node {
            space_id: space_id.to_string(),
            id: id.to_string(),
            parent_id: node_attrs.string(attrs::PARENTID_ATTR).unwrap_or_default(),
            name: node_attrs.string(attrs::NAME_ATTR).unwrap_or_default(),
            blob_id: node_attrs.string(attrs::BLOBID_ATTR),
            blobsize: node_attrs.i64(attrs::BLOBSIZE_ATTR).unwrap_or(0),
            node_type: node_attrs.node_type().unwrap_or(NodeType::File),
            path,
            exists: true,
        })
    }

    pub fn is_space_root(&self) -> bool {
        self.id == self.space_id
    }

    /// Authoritative modification time from the mtime attribute.
    pub async fn mtime(&self, backend: &dyn MetadataBackend) -> Result<DateTime<Utc>> {
        let raw = backend.get(&self.path, attrs::MTIME_ATTR).await?;
        attrs::parse_time(&String::from_utf8_lossy(&raw))
    }

    /// Owner of the space this node belongs to, read from the space root.
    pub async fn owner(&self, lookup: &Lookup) -> Result<UserId> {
        let root_path = lookup.internal_path(&self.space_id, &self.space_id).await?;
        let backend = lookup.metadata_backend();
        let idp = backend
            .get(&root_path, attrs::OWNER_IDP_ATTR)
            .await
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default();
        let opaque_id = backend
            .get(&root_path, attrs::OWNER_ID_ATTR)
            .await
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default();
        Ok(UserId { idp, opaque_id })
    }

    /// Path of the current-content sidecar.
    pub fn current_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(CURRENT_SUFFIX);
        PathBuf::from(os)
    }

    /// Mark the node as being processed by the given upload session.
    pub async fn mark_processing(
        &self,
        backend: &dyn MetadataBackend,
        session_id: &str,
    ) -> Result<()> {
        let value = format!("{}{}", attrs::PROCESSING_STATUS, session_id);
        backend
            .set(&self.path, attrs::STATUS_ATTR, value.as_bytes())
            .await
    }

    /// Clear the processing marker, but only if it still belongs to the
    /// given session.
    pub async fn unmark_processing(
        &self,
        backend: &dyn MetadataBackend,
        session_id: &str,
    ) -> Result<()> {
        match backend.get(&self.path, attrs::STATUS_ATTR).await {
            Ok(raw) => {
                let status = String::from_utf8_lossy(&raw).into_owned();
                if status == format!("{}{}", attrs::PROCESSING_STATUS, session_id) {
                    backend.remove(&self.path, attrs::STATUS_ATTR).await?;
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn is_processing(&self, backend: &dyn MetadataBackend) -> bool {
        matches!(
            backend.get(&self.path, attrs::STATUS_ATTR).await,
            Ok(raw) if String::from_utf8_lossy(&raw).starts_with(attrs::PROCESSING_STATUS)
        )
    }
}

/// Deterministic etag for optimistic concurrency, derived from the node id
/// and its authoritative mtime.
pub fn calculate_etag(id: &str, mtime: DateTime<Utc>) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}", id, attrs::format_time(mtime)).as_bytes());
    let digest = hasher.finalize();
    let mut etag = String::with_capacity(digest.len() * 2 + 2);
    etag.push('"');
    for byte in digest {
        etag.push_str(&format!("{:02x}", byte));
    }
    etag.push('"');
    etag
}

/// Checksums of a blob, computed in one streaming pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksums {
    pub sha1: Vec<u8>,
    pub md5: Vec<u8>,
    pub adler32: Vec<u8>,
}

pub async fn calculate_checksums(path: &Path) -> Result<Checksums> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut sha1 = Sha1::new();
    let mut md5 = Md5::new();
    let mut adler = RollingAdler32::new();

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sha1.update(&buf[..n]);
        md5.update(&buf[..n]);
        adler.update_buffer(&buf[..n]);
    }

    Ok(Checksums {
        sha1: sha1.finalize().to_vec(),
        md5: md5.finalize().to_vec(),
        adler32: adler.hash().to_be_bytes().to_vec(),
    })
}

/// Verify the space quota allows replacing `old_size` bytes with `new_size`.
/// A space without a quota attribute is unlimited.
pub async fn check_quota(
    backend: &dyn MetadataBackend,
    space_root_path: &Path,
    old_size: i64,
    new_size: i64,
) -> Result<()> {
    let quota = match backend.get_i64(space_root_path, attrs::QUOTA_ATTR).await {
        Ok(q) => q,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let used = backend
        .get_i64(space_root_path, attrs::TREESIZE_ATTR)
        .await
        .unwrap_or(0);
    if used - old_size + new_size > quota {
        return Err(Error::QuotaExceeded(format!(
            "quota {} exceeded: {} used, upload of {} bytes replaces {}",
            quota, used, new_size, old_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_etag_is_deterministic() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let a = calculate_etag("node-1", t);
        let b = calculate_etag("node-1", t);
        assert_eq!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));

        let later = t + chrono::Duration::nanoseconds(1);
        assert_ne!(a, calculate_etag("node-1", later));
        assert_ne!(a, calculate_etag("node-2", t));
    }

    #[tokio::test]
    async fn test_checksums_known_vector() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        tokio::fs::write(&file, b"abcdefgh").await.unwrap();

        let sums = calculate_checksums(&file).await.unwrap();
        assert_eq!(
            hex(&sums.md5),
            "e8dc4081b13434b45189a720b77b6818",
        );
        assert_eq!(
            hex(&sums.sha1),
            "425af12a0743502b322e93a015bcf868e324d56a",
        );
        // adler32("abcdefgh") = 0x0e000325
        assert_eq!(sums.adler32, vec![0x0e, 0x00, 0x03, 0x25]);
    }

    #[tokio::test]
    async fn test_checksums_empty_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("empty");
        tokio::fs::write(&file, b"").await.unwrap();

        let sums = calculate_checksums(&file).await.unwrap();
        assert_eq!(hex(&sums.md5), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(sums.adler32, vec![0, 0, 0, 1]);
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
