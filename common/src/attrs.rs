//! Extended attribute model
//!
//! Every node persists its metadata as extended attributes on the underlying
//! path. All keys live under the `user.oc.` namespace; this module holds the
//! key constants and a typed view over a raw attribute map.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Namespace prefix shared by all attribute keys.
pub const OC_PREFIX: &str = "user.oc.";

pub const ID_ATTR: &str = "user.oc.id";
pub const PARENTID_ATTR: &str = "user.oc.parentid";
pub const NAME_ATTR: &str = "user.oc.name";
pub const TYPE_ATTR: &str = "user.oc.type";
pub const BLOBID_ATTR: &str = "user.oc.blobid";
pub const BLOBSIZE_ATTR: &str = "user.oc.blobsize";
pub const MTIME_ATTR: &str = "user.oc.mtime";
pub const TREESIZE_ATTR: &str = "user.oc.treesize";
pub const PROPAGATION_ATTR: &str = "user.oc.propagation";
pub const STATUS_ATTR: &str = "user.oc.status";
pub const DIRTY_ATTR: &str = "user.oc.dirty";
pub const QUOTA_ATTR: &str = "user.oc.quota";
pub const OWNER_IDP_ATTR: &str = "user.oc.owner.idp";
pub const OWNER_ID_ATTR: &str = "user.oc.owner.id";

/// Prefix for the per-algorithm checksum attributes
/// (`user.oc.cs.sha1`, `user.oc.cs.md5`, `user.oc.cs.adler32`).
pub const CHECKSUM_PREFIX: &str = "user.oc.cs.";

/// Value prefix of `user.oc.status` while an upload is being processed;
/// the upload session id follows the prefix.
pub const PROCESSING_STATUS: &str = "processing:";

/// Node type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File = 1,
    Container = 2,
}

impl NodeType {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(NodeType::File),
            2 => Some(NodeType::Container),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, NodeType::Container)
    }
}

/// Raw attribute map with typed accessors
///
/// Attribute values are byte strings; checksums are raw digest bytes, all
/// other values are UTF-8. Timestamps are RFC 3339 with nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct Attributes(pub HashMap<String, Vec<u8>>);

impl Attributes {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn i64(&self, key: &str) -> Result<i64> {
        let raw = self
            .string(key)
            .ok_or_else(|| Error::Internal(format!("attribute {} not set", key)))?;
        raw.parse::<i64>()
            .map_err(|e| Error::Internal(format!("attribute {} is not an integer: {}", key, e)))
    }

    pub fn time(&self, key: &str) -> Result<DateTime<Utc>> {
        let raw = self
            .string(key)
            .ok_or_else(|| Error::Internal(format!("attribute {} not set", key)))?;
        parse_time(&raw)
    }

    pub fn node_type(&self) -> Option<NodeType> {
        self.i64(TYPE_ATTR).ok().and_then(NodeType::from_i64)
    }

    pub fn set(&mut self, key: &str, value: Vec<u8>) {
        self.0.insert(key.to_string(), value);
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.as_bytes().to_vec());
    }

    pub fn set_i64(&mut self, key: &str, value: i64) {
        self.set_string(key, &value.to_string());
    }

    pub fn set_time(&mut self, key: &str, value: DateTime<Utc>) {
        self.set_string(key, &format_time(value));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, Vec<u8>>> for Attributes {
    fn from(map: HashMap<String, Vec<u8>>) -> Self {
        Self(map)
    }
}

/// Format a timestamp the way it is persisted in xattrs (RFC 3339, UTC,
/// nanosecond precision).
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a persisted timestamp.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("invalid timestamp {:?}: {}", raw, e)))
}
