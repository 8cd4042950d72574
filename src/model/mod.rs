//! Per-aggregate models built by folding events
//!
//! A model is the queryable state of one aggregate. The variant is a pure
//! function of the aggregate href — the well-known hrefs map to the
//! device-scoped models, everything else is a plain resource — so replay
//! after eviction always reconstructs the same shape.
//!
//! Models mutate only inside [`Model::apply`]; readers receive clones taken
//! under the aggregate lock, never references into live state.

mod links;
mod metadata;
mod resource;

pub use links::ResourceLinksModel;
pub use metadata::DeviceMetadataModel;
pub use resource::ResourceModel;

use tracing::warn;

use crate::events::{
    EventEnvelope, PendingCommand, PendingCommandKind, ResourceId, DEVICE_METADATA_HREF,
    RESOURCE_LINKS_HREF,
};

/// One pending command together with the aggregate it targets, as returned
/// by the pending-commands query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommandEntry {
    pub resource_id: ResourceId,
    pub kind: PendingCommandKind,
    pub command: PendingCommand,
}

/// Polymorphic aggregate state.
#[derive(Debug, Clone)]
pub enum Model {
    Resource(ResourceModel),
    Links(ResourceLinksModel),
    Metadata(DeviceMetadataModel),
}

impl Model {
    /// Factory: decide the variant from the aggregate href. Pure, so the
    /// same key always produces the same variant.
    pub fn new_for(href: &str) -> Model {
        match href {
            RESOURCE_LINKS_HREF => Model::Links(ResourceLinksModel::default()),
            DEVICE_METADATA_HREF => Model::Metadata(DeviceMetadataModel::default()),
            _ => Model::Resource(ResourceModel::default()),
        }
    }

    /// Fold one event. Returns `true` when the event mutated the model;
    /// payloads that do not belong to this variant are logged and skipped.
    pub(crate) fn apply(&mut self, event: &EventEnvelope) -> bool {
        let applied = match self {
            Model::Resource(m) => m.apply(event),
            Model::Links(m) => m.apply(event),
            Model::Metadata(m) => m.apply(event),
        };
        if !applied {
            warn!(
                resource_id = %event.resource_id,
                kind = %event.kind(),
                "event not applicable to model, skipped"
            );
        }
        applied
    }

    /// A model is vacant while no event has ever been folded into it; a
    /// vacant model must surface as "not found", never as zero-value state.
    pub fn is_vacant(&self) -> bool {
        match self {
            Model::Resource(m) => m.resource_id().is_none(),
            Model::Links(m) => m.device_id().is_none(),
            Model::Metadata(m) => m.device_id().is_none(),
        }
    }

    pub fn as_resource(&self) -> Option<&ResourceModel> {
        match self {
            Model::Resource(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&ResourceLinksModel> {
        match self {
            Model::Links(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_metadata(&self) -> Option<&DeviceMetadataModel> {
        match self {
            Model::Metadata(m) => Some(m),
            _ => None,
        }
    }
}

/// Remove the pending entry matching `correlation_id`; no-op when absent so
/// terminal-event redelivery stays idempotent.
pub(crate) fn remove_pending(pendings: &mut Vec<PendingCommand>, correlation_id: uuid::Uuid) {
    pendings.retain(|p| p.correlation_id != correlation_id);
}
