//! Resource aggregate model
//!
//! Tracks the latest reported content and the outstanding pending commands
//! of one resource. Content-changed events are versioned separately from the
//! aggregate version because content subscribers de-duplicate only on the
//! content stream.

use chrono::{DateTime, Utc};

use crate::events::{
    EventEnvelope, EventPayload, PendingCommand, PendingCommandKind, ResourceChanged, ResourceId,
};
use crate::subscription::filter::FilterBitmask;

use super::{remove_pending, PendingCommandEntry};

#[derive(Debug, Clone, Default)]
pub struct ResourceModel {
    resource_id: Option<ResourceId>,
    content: Option<ResourceChanged>,
    on_resource_changed_version: u64,
    create_pendings: Vec<PendingCommand>,
    retrieve_pendings: Vec<PendingCommand>,
    update_pendings: Vec<PendingCommand>,
    delete_pendings: Vec<PendingCommand>,
}

impl ResourceModel {
    pub fn resource_id(&self) -> Option<&ResourceId> {
        self.resource_id.as_ref()
    }

    /// Latest content, `None` until the first change or snapshot arrives.
    pub fn content(&self) -> Option<&ResourceChanged> {
        self.content.as_ref()
    }

    /// Version of the last applied content change, independent of the
    /// aggregate version.
    pub fn on_resource_changed_version(&self) -> u64 {
        self.on_resource_changed_version
    }

    pub(crate) fn apply(&mut self, event: &EventEnvelope) -> bool {
        match &event.payload {
            EventPayload::ResourceChanged(changed) => {
                // last-write-wins by version, enforced by the aggregate gate
                self.content = Some(changed.clone());
                self.on_resource_changed_version = event.version;
            }
            EventPayload::ResourceCreatePending(cmd) => self.create_pendings.push(cmd.clone()),
            EventPayload::ResourceCreated(done) => {
                remove_pending(&mut self.create_pendings, done.correlation_id);
            }
            EventPayload::ResourceRetrievePending(cmd) => self.retrieve_pendings.push(cmd.clone()),
            EventPayload::ResourceRetrieved(done) => {
                remove_pending(&mut self.retrieve_pendings, done.correlation_id);
            }
            EventPayload::ResourceUpdatePending(cmd) => self.update_pendings.push(cmd.clone()),
            EventPayload::ResourceUpdated(done) => {
                remove_pending(&mut self.update_pendings, done.correlation_id);
            }
            EventPayload::ResourceDeletePending(cmd) => self.delete_pendings.push(cmd.clone()),
            EventPayload::ResourceDeleted(done) => {
                remove_pending(&mut self.delete_pendings, done.correlation_id);
            }
            EventPayload::ResourceStateSnapshotTaken(snapshot) => {
                self.content = snapshot.latest_change.clone();
                if self.content.is_some() {
                    self.on_resource_changed_version = event.version;
                }
                self.create_pendings = snapshot.create_pendings.clone();
                self.retrieve_pendings = snapshot.retrieve_pendings.clone();
                self.update_pendings = snapshot.update_pendings.clone();
                self.delete_pendings = snapshot.delete_pendings.clone();
            }
            _ => return false,
        }
        self.resource_id = Some(event.resource_id.clone());
        true
    }

    /// Outstanding commands selected by `filter`, skipping entries expired
    /// at `now`.
    pub fn pending_commands(
        &self,
        filter: FilterBitmask,
        now: DateTime<Utc>,
    ) -> Vec<PendingCommandEntry> {
        let Some(resource_id) = &self.resource_id else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let lists = [
            (
                FilterBitmask::RESOURCE_CREATE_PENDING,
                PendingCommandKind::ResourceCreate,
                &self.create_pendings,
            ),
            (
                FilterBitmask::RESOURCE_RETRIEVE_PENDING,
                PendingCommandKind::ResourceRetrieve,
                &self.retrieve_pendings,
            ),
            (
                FilterBitmask::RESOURCE_UPDATE_PENDING,
                PendingCommandKind::ResourceUpdate,
                &self.update_pendings,
            ),
            (
                FilterBitmask::RESOURCE_DELETE_PENDING,
                PendingCommandKind::ResourceDelete,
                &self.delete_pendings,
            ),
        ];
        for (bit, kind, pendings) in lists {
            if !filter.is_set(bit) {
                continue;
            }
            for cmd in pendings {
                if cmd.is_expired(now) {
                    continue;
                }
                out.push(PendingCommandEntry {
                    resource_id: resource_id.clone(),
                    kind,
                    command: cmd.clone(),
                });
            }
        }
        out
    }
}
