//! Domain events consumed by the projection layer
//!
//! Every event carries the `(device_id, href)` aggregate key plus a
//! per-aggregate version assigned by the writer side. The projection never
//! produces these events, it only folds them; the payload enum is the closed
//! set of kinds the fold dispatch and the subscription filter agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod pending;

pub use pending::{
    CommandDone, CommandStatus, MetadataUpdate, MetadataUpdatePending, PendingCommand,
    PendingCommandKind,
};

/// Href of the per-device resource-links aggregate.
pub const RESOURCE_LINKS_HREF: &str = "/plgd/res";

/// Href of the per-device metadata aggregate.
pub const DEVICE_METADATA_HREF: &str = "/plgd/dev";

/// Aggregate key: one resource of one device.
///
/// The well-known hrefs [`RESOURCE_LINKS_HREF`] and [`DEVICE_METADATA_HREF`]
/// address the device-scoped aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub device_id: String,
    pub href: String,
}

impl ResourceId {
    pub fn new(device_id: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            href: href.into(),
        }
    }

    /// Key of the device's resource-links aggregate.
    pub fn links(device_id: impl Into<String>) -> Self {
        Self::new(device_id, RESOURCE_LINKS_HREF)
    }

    /// Key of the device's metadata aggregate.
    pub fn metadata(device_id: impl Into<String>) -> Self {
        Self::new(device_id, DEVICE_METADATA_HREF)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.device_id, self.href)
    }
}

/// Opaque resource representation as last reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Media type of `data`, e.g. `application/json`.
    pub content_type: String,
    pub data: serde_json::Value,
}

impl Content {
    pub fn json(data: serde_json::Value) -> Self {
        Self {
            content_type: "application/json".to_string(),
            data,
        }
    }
}

/// One published resource link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    pub href: String,
    pub resource_types: Vec<String>,
    pub interfaces: Vec<String>,
}

/// Device connection status as tracked by the metadata aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Twin (resource shadow) synchronization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TwinSyncStatus {
    OutOfSync,
    Syncing,
    InSync,
    Disabled,
}

/// Latest content reported for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChanged {
    pub content: Content,
}

/// Compaction snapshot of one resource aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceStateSnapshot {
    pub latest_change: Option<ResourceChanged>,
    pub create_pendings: Vec<PendingCommand>,
    pub retrieve_pendings: Vec<PendingCommand>,
    pub update_pendings: Vec<PendingCommand>,
    pub delete_pendings: Vec<PendingCommand>,
}

/// Terminal metadata-update event; also carries gateway-driven connection
/// transitions which have no originating command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdated {
    pub correlation_id: Option<uuid::Uuid>,
    pub connection: ConnectionStatus,
    pub twin_sync: TwinSyncStatus,
}

/// Compaction snapshot of one device-metadata aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadataSnapshot {
    pub connection: ConnectionStatus,
    pub twin_sync: TwinSyncStatus,
    pub update_pendings: Vec<MetadataUpdatePending>,
}

/// Closed set of event kinds.
///
/// `DeviceRegistered`/`DeviceUnregistered` never appear on the event bus;
/// they are synthesized by the subscription registry when the owner's device
/// set changes. Everything else is written by the resource aggregate and
/// delivered through both the store and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ResourceCreatePending,
    ResourceCreated,
    ResourceRetrievePending,
    ResourceRetrieved,
    ResourceUpdatePending,
    ResourceUpdated,
    ResourceDeletePending,
    ResourceDeleted,
    ResourceChanged,
    ResourceStateSnapshotTaken,
    ResourceLinksPublished,
    ResourceLinksUnpublished,
    ResourceLinksSnapshotTaken,
    DeviceMetadataUpdatePending,
    DeviceMetadataUpdated,
    DeviceMetadataSnapshotTaken,
    DeviceRegistered,
    DeviceUnregistered,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Event payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    ResourceCreatePending(PendingCommand),
    ResourceCreated(CommandDone),
    ResourceRetrievePending(PendingCommand),
    ResourceRetrieved(CommandDone),
    ResourceUpdatePending(PendingCommand),
    ResourceUpdated(CommandDone),
    ResourceDeletePending(PendingCommand),
    ResourceDeleted(CommandDone),
    ResourceChanged(ResourceChanged),
    ResourceStateSnapshotTaken(ResourceStateSnapshot),
    ResourceLinksPublished { links: Vec<ResourceLink> },
    ResourceLinksUnpublished { hrefs: Vec<String> },
    ResourceLinksSnapshotTaken { links: Vec<ResourceLink> },
    DeviceMetadataUpdatePending(MetadataUpdatePending),
    DeviceMetadataUpdated(MetadataUpdated),
    DeviceMetadataSnapshotTaken(DeviceMetadataSnapshot),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ResourceCreatePending(_) => EventKind::ResourceCreatePending,
            EventPayload::ResourceCreated(_) => EventKind::ResourceCreated,
            EventPayload::ResourceRetrievePending(_) => EventKind::ResourceRetrievePending,
            EventPayload::ResourceRetrieved(_) => EventKind::ResourceRetrieved,
            EventPayload::ResourceUpdatePending(_) => EventKind::ResourceUpdatePending,
            EventPayload::ResourceUpdated(_) => EventKind::ResourceUpdated,
            EventPayload::ResourceDeletePending(_) => EventKind::ResourceDeletePending,
            EventPayload::ResourceDeleted(_) => EventKind::ResourceDeleted,
            EventPayload::ResourceChanged(_) => EventKind::ResourceChanged,
            EventPayload::ResourceStateSnapshotTaken(_) => EventKind::ResourceStateSnapshotTaken,
            EventPayload::ResourceLinksPublished { .. } => EventKind::ResourceLinksPublished,
            EventPayload::ResourceLinksUnpublished { .. } => EventKind::ResourceLinksUnpublished,
            EventPayload::ResourceLinksSnapshotTaken { .. } => {
                EventKind::ResourceLinksSnapshotTaken
            }
            EventPayload::DeviceMetadataUpdatePending(_) => EventKind::DeviceMetadataUpdatePending,
            EventPayload::DeviceMetadataUpdated(_) => EventKind::DeviceMetadataUpdated,
            EventPayload::DeviceMetadataSnapshotTaken(_) => EventKind::DeviceMetadataSnapshotTaken,
        }
    }

    /// Snapshot events replace the whole aggregate state and bound replay.
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            EventPayload::ResourceStateSnapshotTaken(_)
                | EventPayload::ResourceLinksSnapshotTaken { .. }
                | EventPayload::DeviceMetadataSnapshotTaken(_)
        )
    }
}

/// One committed event as delivered by the store and the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub resource_id: ResourceId,
    /// Per-aggregate version, monotonically increasing in commit order.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EventEnvelope {
    pub fn new(resource_id: ResourceId, version: u64, payload: EventPayload) -> Self {
        Self {
            resource_id,
            version,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn is_snapshot(&self) -> bool {
        self.payload.is_snapshot()
    }

    pub fn device_id(&self) -> &str {
        &self.resource_id.device_id
    }

    pub fn href(&self) -> &str {
        &self.resource_id.href
    }
}
