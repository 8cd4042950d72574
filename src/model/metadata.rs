//! Device-metadata aggregate model
//!
//! Connection and twin-synchronization status of one device plus pending
//! metadata-update commands.

use chrono::{DateTime, Utc};

use crate::events::{
    ConnectionStatus, EventEnvelope, EventPayload, MetadataUpdatePending, PendingCommand,
    PendingCommandKind, ResourceId, TwinSyncStatus,
};
use crate::subscription::filter::FilterBitmask;

use super::PendingCommandEntry;

#[derive(Debug, Clone)]
pub struct DeviceMetadataModel {
    device_id: Option<String>,
    connection: ConnectionStatus,
    twin_sync: TwinSyncStatus,
    update_pendings: Vec<MetadataUpdatePending>,
    on_metadata_updated_version: u64,
}

impl Default for DeviceMetadataModel {
    fn default() -> Self {
        Self {
            device_id: None,
            connection: ConnectionStatus::Offline,
            twin_sync: TwinSyncStatus::OutOfSync,
            update_pendings: Vec::new(),
            on_metadata_updated_version: 0,
        }
    }
}

impl DeviceMetadataModel {
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn is_online(&self) -> bool {
        self.connection == ConnectionStatus::Online
    }

    pub fn twin_sync(&self) -> TwinSyncStatus {
        self.twin_sync
    }

    /// Version of the last applied metadata update.
    pub fn on_metadata_updated_version(&self) -> u64 {
        self.on_metadata_updated_version
    }

    pub fn update_pendings(&self) -> &[MetadataUpdatePending] {
        &self.update_pendings
    }

    pub(crate) fn apply(&mut self, event: &EventEnvelope) -> bool {
        match &event.payload {
            EventPayload::DeviceMetadataUpdatePending(pending) => {
                self.update_pendings.push(pending.clone());
            }
            EventPayload::DeviceMetadataUpdated(updated) => {
                self.connection = updated.connection;
                self.twin_sync = updated.twin_sync;
                self.on_metadata_updated_version = event.version;
                if let Some(correlation_id) = updated.correlation_id {
                    self.update_pendings
                        .retain(|p| p.correlation_id != correlation_id);
                }
            }
            EventPayload::DeviceMetadataSnapshotTaken(snapshot) => {
                self.connection = snapshot.connection;
                self.twin_sync = snapshot.twin_sync;
                self.update_pendings = snapshot.update_pendings.clone();
                self.on_metadata_updated_version = event.version;
            }
            _ => return false,
        }
        self.device_id = Some(event.resource_id.device_id.clone());
        true
    }

    /// Pending metadata updates selected by `filter`, skipping expired
    /// entries.
    pub fn pending_commands(
        &self,
        filter: FilterBitmask,
        now: DateTime<Utc>,
    ) -> Vec<PendingCommandEntry> {
        let Some(device_id) = &self.device_id else {
            return Vec::new();
        };
        if !filter.is_set(FilterBitmask::DEVICE_METADATA_UPDATE_PENDING) {
            return Vec::new();
        }
        self.update_pendings
            .iter()
            .filter(|p| !p.is_expired(now))
            .map(|p| PendingCommandEntry {
                resource_id: ResourceId::metadata(device_id.clone()),
                kind: PendingCommandKind::DeviceMetadataUpdate,
                command: PendingCommand {
                    correlation_id: p.correlation_id,
                    content: None,
                    valid_until: p.valid_until,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MetadataUpdate, MetadataUpdated};
    use uuid::Uuid;

    fn env(version: u64, payload: EventPayload) -> EventEnvelope {
        EventEnvelope::new(ResourceId::metadata("d1"), version, payload)
    }

    fn pending(correlation_id: Uuid) -> MetadataUpdatePending {
        MetadataUpdatePending {
            correlation_id,
            update: MetadataUpdate { twin_enabled: true },
            valid_until: None,
        }
    }

    #[test]
    fn starts_offline_and_out_of_sync() {
        let model = DeviceMetadataModel::default();
        assert_eq!(model.connection(), ConnectionStatus::Offline);
        assert_eq!(model.twin_sync(), TwinSyncStatus::OutOfSync);
    }

    #[test]
    fn updated_sets_status_and_clears_matching_pending() {
        let corr = Uuid::new_v4();
        let mut model = DeviceMetadataModel::default();
        model.apply(&env(0, EventPayload::DeviceMetadataUpdatePending(pending(corr))));
        model.apply(&env(
            1,
            EventPayload::DeviceMetadataUpdated(MetadataUpdated {
                correlation_id: Some(corr),
                connection: ConnectionStatus::Online,
                twin_sync: TwinSyncStatus::InSync,
            }),
        ));
        assert!(model.is_online());
        assert_eq!(model.on_metadata_updated_version(), 1);
        assert!(model
            .pending_commands(FilterBitmask::ALL, Utc::now())
            .is_empty());
    }

    #[test]
    fn gateway_driven_update_keeps_pendings() {
        let mut model = DeviceMetadataModel::default();
        model.apply(&env(
            0,
            EventPayload::DeviceMetadataUpdatePending(pending(Uuid::new_v4())),
        ));
        model.apply(&env(
            1,
            EventPayload::DeviceMetadataUpdated(MetadataUpdated {
                correlation_id: None,
                connection: ConnectionStatus::Online,
                twin_sync: TwinSyncStatus::Syncing,
            }),
        ));
        assert_eq!(
            model.pending_commands(FilterBitmask::ALL, Utc::now()).len(),
            1
        );
    }
}
