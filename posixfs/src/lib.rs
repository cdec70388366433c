//! POSIX-backed decomposed file storage engine
//!
//! Maps a logical namespace (spaces, nodes, versions, trash) onto a POSIX
//! filesystem augmented with extended attributes. The engine provides:
//! - stable opaque node identifiers surviving moves and out-of-band changes
//! - atomic moves, in-place revisions and a per-space trash with restore
//! - propagated tree metadata (size, modification time)
//! - resumable upload sessions with optimistic concurrency
//! - a debounced reconciler assimilating out-of-band filesystem changes

pub mod assimilation;
pub mod blobstore;
pub mod idcache;
pub mod lookup;
pub mod node;
pub mod permissions;
pub mod revisions;
pub mod trashbin;
pub mod tree;
pub mod upload;
pub mod usermapper;

#[cfg(test)]
mod engine_tests;

pub use assimilation::{EventAction, ScanDebouncer, ScanItem};
pub use blobstore::{BlobStore, PosixBlobStore};
pub use idcache::IdCache;
pub use lookup::Lookup;
pub use node::Node;
pub use permissions::{AllowAll, PermissionsChecker, ResourcePermissions};
pub use revisions::{FileVersion, ResourceInfo};
pub use trashbin::{RecycleItem, RestoreRef, Trashbin};
pub use tree::Tree;
pub use upload::{UploadSession, UploadStore};
pub use usermapper::{NoopUserMapper, UserMapper};
