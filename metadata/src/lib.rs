//! Metadata persistence layer
//!
//! This crate defines the interface for reading and writing node metadata
//! and provides the extended-attribute implementation used by the POSIX
//! engine. Metadata lives directly on the node's inode; per-node write
//! exclusion is provided by advisory locks on `.mlock` sidecar files.

pub mod backend;
pub mod lockedfile;
pub mod xattrs;

pub use backend::MetadataBackend;
pub use lockedfile::LockedFile;
pub use xattrs::XattrsBackend;
