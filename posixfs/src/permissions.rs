//! Permission assembly
//!
//! Authorization decisions are delegated to an external checker; the engine
//! only consumes the resulting bitset. Operations on a node the caller may
//! not even stat report `NotFound` instead of `PermissionDenied` so callers
//! cannot probe for existence.

use async_trait::async_trait;

use common::Result;

use crate::node::Node;

/// Rights a caller holds on a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcePermissions {
    pub stat: bool,
    pub initiate_file_download: bool,
    pub list_file_versions: bool,
    pub restore_file_version: bool,
    pub list_recycle: bool,
    pub restore_recycle_item: bool,
    pub purge_recycle: bool,
    pub create_container: bool,
    pub delete: bool,
    pub move_resource: bool,
}

impl ResourcePermissions {
    pub fn full() -> Self {
        Self {
            stat: true,
            initiate_file_download: true,
            list_file_versions: true,
            restore_file_version: true,
            list_recycle: true,
            restore_recycle_item: true,
            purge_recycle: true,
            create_container: true,
            delete: true,
            move_resource: true,
        }
    }

    pub fn stat_only() -> Self {
        Self {
            stat: true,
            ..Self::default()
        }
    }
}

/// Trait for assembling the caller's permissions on a node
#[async_trait]
pub trait PermissionsChecker: Send + Sync {
    async fn assemble_permissions(&self, node: &Node) -> Result<ResourcePermissions>;

    /// Permissions on a trashed item, resolved against its former space.
    async fn assemble_trash_permissions(&self, node: &Node) -> Result<ResourcePermissions>;
}

/// Checker granting every right. Used for embedding and tests.
pub struct AllowAll;

#[async_trait]
impl PermissionsChecker for AllowAll {
    async fn assemble_permissions(&self, _node: &Node) -> Result<ResourcePermissions> {
        Ok(ResourcePermissions::full())
    }

    async fn assemble_trash_permissions(&self, _node: &Node) -> Result<ResourcePermissions> {
        Ok(ResourcePermissions::full())
    }
}
