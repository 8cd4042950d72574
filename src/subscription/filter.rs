//! Event-kind filter bitmask
//!
//! A compact set of "interested in kind X" flags carried by every
//! subscription and by the pending-commands query. Clients rely on the
//! default-expansion rule: an empty requested filter means everything, not
//! nothing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::events::{EventKind, PendingCommandKind};

/// Closed set of notification flags, one bit per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterBitmask(u64);

impl FilterBitmask {
    pub const NONE: FilterBitmask = FilterBitmask(0);
    pub const RESOURCE_CREATE_PENDING: FilterBitmask = FilterBitmask(1);
    pub const RESOURCE_CREATED: FilterBitmask = FilterBitmask(1 << 1);
    pub const RESOURCE_RETRIEVE_PENDING: FilterBitmask = FilterBitmask(1 << 2);
    pub const RESOURCE_RETRIEVED: FilterBitmask = FilterBitmask(1 << 3);
    pub const RESOURCE_UPDATE_PENDING: FilterBitmask = FilterBitmask(1 << 4);
    pub const RESOURCE_UPDATED: FilterBitmask = FilterBitmask(1 << 5);
    pub const RESOURCE_DELETE_PENDING: FilterBitmask = FilterBitmask(1 << 6);
    pub const RESOURCE_DELETED: FilterBitmask = FilterBitmask(1 << 7);
    pub const DEVICE_METADATA_UPDATE_PENDING: FilterBitmask = FilterBitmask(1 << 8);
    pub const DEVICE_METADATA_UPDATED: FilterBitmask = FilterBitmask(1 << 9);
    pub const DEVICE_REGISTERED: FilterBitmask = FilterBitmask(1 << 10);
    pub const DEVICE_UNREGISTERED: FilterBitmask = FilterBitmask(1 << 11);
    pub const RESOURCE_CHANGED: FilterBitmask = FilterBitmask(1 << 12);
    pub const RESOURCES_PUBLISHED: FilterBitmask = FilterBitmask(1 << 13);
    pub const RESOURCES_UNPUBLISHED: FilterBitmask = FilterBitmask(1 << 14);

    /// Every kind; the "no filter requested" expansion for subscriptions.
    pub const ALL: FilterBitmask = FilterBitmask(u64::MAX);

    /// Every pending-command kind; the "no filter requested" expansion for
    /// the pending-commands query.
    pub const ALL_PENDING: FilterBitmask = FilterBitmask(
        Self::RESOURCE_CREATE_PENDING.0
            | Self::RESOURCE_RETRIEVE_PENDING.0
            | Self::RESOURCE_UPDATE_PENDING.0
            | Self::RESOURCE_DELETE_PENDING.0
            | Self::DEVICE_METADATA_UPDATE_PENDING.0,
    );

    pub fn is_set(self, flag: FilterBitmask) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn union(self, other: FilterBitmask) -> FilterBitmask {
        FilterBitmask(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bit representing one event kind. Exhaustive by construction: a new
    /// kind without a bit fails to compile.
    pub fn for_kind(kind: EventKind) -> FilterBitmask {
        match kind {
            EventKind::ResourceCreatePending => Self::RESOURCE_CREATE_PENDING,
            EventKind::ResourceCreated => Self::RESOURCE_CREATED,
            EventKind::ResourceRetrievePending => Self::RESOURCE_RETRIEVE_PENDING,
            EventKind::ResourceRetrieved => Self::RESOURCE_RETRIEVED,
            EventKind::ResourceUpdatePending => Self::RESOURCE_UPDATE_PENDING,
            EventKind::ResourceUpdated => Self::RESOURCE_UPDATED,
            EventKind::ResourceDeletePending => Self::RESOURCE_DELETE_PENDING,
            EventKind::ResourceDeleted => Self::RESOURCE_DELETED,
            EventKind::ResourceChanged => Self::RESOURCE_CHANGED,
            // snapshots re-materialize state already covered by the kinds
            // above; subscribers see their effects, not the snapshots
            EventKind::ResourceStateSnapshotTaken => Self::RESOURCE_CHANGED,
            EventKind::ResourceLinksPublished => Self::RESOURCES_PUBLISHED,
            EventKind::ResourceLinksUnpublished => Self::RESOURCES_UNPUBLISHED,
            EventKind::ResourceLinksSnapshotTaken => Self::RESOURCES_PUBLISHED,
            EventKind::DeviceMetadataUpdatePending => Self::DEVICE_METADATA_UPDATE_PENDING,
            EventKind::DeviceMetadataUpdated => Self::DEVICE_METADATA_UPDATED,
            EventKind::DeviceMetadataSnapshotTaken => Self::DEVICE_METADATA_UPDATED,
            EventKind::DeviceRegistered => Self::DEVICE_REGISTERED,
            EventKind::DeviceUnregistered => Self::DEVICE_UNREGISTERED,
        }
    }

    /// Expand a requested event-kind list; empty means all kinds.
    pub fn from_event_kinds(kinds: &[EventKind]) -> FilterBitmask {
        if kinds.is_empty() {
            return Self::ALL;
        }
        kinds
            .iter()
            .fold(Self::NONE, |acc, kind| acc.union(Self::for_kind(*kind)))
    }

    /// Expand a requested pending-command-kind list; empty means all
    /// pending kinds.
    pub fn from_pending_kinds(kinds: &[PendingCommandKind]) -> FilterBitmask {
        if kinds.is_empty() {
            return Self::ALL_PENDING;
        }
        kinds.iter().fold(Self::NONE, |acc, kind| {
            acc.union(match kind {
                PendingCommandKind::ResourceCreate => Self::RESOURCE_CREATE_PENDING,
                PendingCommandKind::ResourceRetrieve => Self::RESOURCE_RETRIEVE_PENDING,
                PendingCommandKind::ResourceUpdate => Self::RESOURCE_UPDATE_PENDING,
                PendingCommandKind::ResourceDelete => Self::RESOURCE_DELETE_PENDING,
                PendingCommandKind::DeviceMetadataUpdate => Self::DEVICE_METADATA_UPDATE_PENDING,
            })
        })
    }
}

impl fmt::Display for FilterBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
