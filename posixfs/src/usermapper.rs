//! User scoping
//!
//! When `use_space_groups` is enabled, filesystem access inside a space runs
//! with the space's gid so POSIX ACLs on the underlying tree stay
//! authoritative. The mapper switches the effective ids; the no-op
//! implementation is used for single-user deployments.

use async_trait::async_trait;
use futures::future::BoxFuture;

use common::Result;

#[async_trait]
pub trait UserMapper: Send + Sync {
    /// Scope the effective uid/gid for subsequent filesystem access.
    /// An id of -1 leaves that id unchanged.
    async fn scope_user_by_ids(&self, uid: i64, gid: i64) -> Result<()>;

    /// Run `f` with the base (unscoped) ids, restoring the previous scope
    /// afterwards.
    async fn run_in_base_scope(&self, f: BoxFuture<'_, Result<()>>) -> Result<()>;
}

/// Mapper that never changes ids.
pub struct NoopUserMapper;

#[async_trait]
impl UserMapper for NoopUserMapper {
    async fn scope_user_by_ids(&self, _uid: i64, _gid: i64) -> Result<()> {
        Ok(())
    }

    async fn run_in_base_scope(&self, f: BoxFuture<'_, Result<()>>) -> Result<()> {
        f.await
    }
}
