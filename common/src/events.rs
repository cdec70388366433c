//! Domain events
//!
//! The engine emits events after metadata mutations commit. Publishing is
//! fire-and-forget; duplicates are allowed and downstream consumers must be
//! idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// Owner of a space, as stored on the space root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct UserId {
    pub idp: String,
    pub opaque_id: String,
}

/// Reference to a node within a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRef {
    pub space_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    ContainerCreated {
        owner: UserId,
        node: NodeRef,
        timestamp: DateTime<Utc>,
    },
    FileTouched {
        owner: UserId,
        node: NodeRef,
        timestamp: DateTime<Utc>,
    },
    UploadReady {
        owner: UserId,
        node: NodeRef,
        filename: String,
        timestamp: DateTime<Utc>,
    },
    ItemMoved {
        owner: UserId,
        node: NodeRef,
        parent_id: String,
        previous_parent_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    ItemTrashed {
        owner: UserId,
        node: NodeRef,
        key: String,
        timestamp: DateTime<Utc>,
    },
    ItemRestored {
        owner: UserId,
        node: NodeRef,
        key: String,
        timestamp: DateTime<Utc>,
    },
    ItemPurged {
        owner: UserId,
        space_id: String,
        key: String,
        timestamp: DateTime<Utc>,
    },
    RevisionRestored {
        owner: UserId,
        node: NodeRef,
        revision_key: String,
        timestamp: DateTime<Utc>,
    },
}

/// Fire-and-forget event sink
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Publisher that drops every event. Used when no event bus is wired up.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}
