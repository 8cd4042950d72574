//! Query layer over the projection: resource shadow and device directory
//!
//! Every query first intersects the requested devices with the caller's
//! owned set, registers them with the projection registry (leaving them warm
//! for the cache expiration afterwards) and streams results through a
//! callback. A resource requested explicitly but absent from the projection
//! triggers at most one store reload of its device before the query gives
//! up with not-found; device-wide queries simply stream what exists.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::errors::{ProjectionError, ProjectionResult};
use crate::events::{
    ConnectionStatus, ResourceChanged, ResourceId, ResourceLink, TwinSyncStatus,
    DEVICE_METADATA_HREF, RESOURCE_LINKS_HREF,
};
use crate::model::{Model, PendingCommandEntry};
use crate::events::PendingCommandKind;
use crate::projection::RegistryHandle;
use crate::subscription::FilterBitmask;

/// Latest known state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState {
    pub resource_id: ResourceId,
    pub content: Option<ResourceChanged>,
    /// Version of the change that produced `content`.
    pub version: u64,
}

/// Published links of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLinks {
    pub device_id: String,
    pub links: Vec<ResourceLink>,
}

/// Metadata view of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadataView {
    pub device_id: String,
    pub connection: ConnectionStatus,
    pub twin_sync: TwinSyncStatus,
}

/// Which round of the lookup is running. Misses during the first pass queue
/// a device reload; misses during the retry are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    Retry,
}

/// Read API over the registry's materialized views.
pub struct ResourceDirectory {
    registry: RegistryHandle,
}

impl ResourceDirectory {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Devices a query touches: the requested ones (explicit filter plus the
    /// devices of explicit resource ids, or all owned when unfiltered),
    /// restricted to what the caller owns. Sorted for stable streaming.
    fn effective_devices(
        device_filter: &[String],
        resource_filter: &[ResourceId],
        owned: &HashSet<String>,
    ) -> BTreeSet<String> {
        if device_filter.is_empty() && resource_filter.is_empty() {
            return owned.iter().cloned().collect();
        }
        device_filter
            .iter()
            .cloned()
            .chain(resource_filter.iter().map(|id| id.device_id.clone()))
            .filter(|device_id| owned.contains(device_id))
            .collect()
    }

    async fn register_all(&self, devices: &BTreeSet<String>) -> ProjectionResult<Vec<String>> {
        let mut registered = Vec::with_capacity(devices.len());
        for device_id in devices {
            match self.registry.register(device_id).await {
                Ok(_) => registered.push(device_id.clone()),
                Err(err) => {
                    self.release_all(&registered).await;
                    return Err(err);
                }
            }
        }
        Ok(registered)
    }

    /// Drop our registrations; the models stay warm until the TTL sweep.
    async fn release_all(&self, devices: &[String]) {
        for device_id in devices {
            let _ = self.registry.unregister(device_id).await;
        }
    }

    /// Stream resource shadows matching the filters.
    ///
    /// `resource_filter` names resources that must exist: any of them still
    /// missing after one reload fails the query with not-found, after the
    /// found ones were streamed.
    pub async fn get_resources(
        &self,
        device_filter: &[String],
        resource_filter: &[ResourceId],
        type_filter: &[String],
        owned: &HashSet<String>,
        mut on_resource: impl FnMut(ResourceState),
    ) -> ProjectionResult<()> {
        let devices = Self::effective_devices(device_filter, resource_filter, owned);
        let registered = self.register_all(&devices).await?;
        let result = self
            .resources_inner(&devices, resource_filter, type_filter, &mut on_resource)
            .await;
        self.release_all(&registered).await;
        result
    }

    async fn resources_inner(
        &self,
        devices: &BTreeSet<String>,
        resource_filter: &[ResourceId],
        type_filter: &[String],
        on_resource: &mut impl FnMut(ResourceState),
    ) -> ProjectionResult<()> {
        let mut pass = Pass::First;
        loop {
            let mut missing: Vec<ResourceId> = Vec::new();
            let mut sent: Vec<ResourceState> = Vec::new();

            for device_id in devices {
                let models = self.registry.device_models(device_id);
                let allowed_hrefs = type_allowed_hrefs(&models, type_filter);
                for (resource_id, model) in &models {
                    if is_device_scoped(&resource_id.href) {
                        continue;
                    }
                    if !resource_filter.is_empty()
                        && !resource_filter.contains(resource_id)
                    {
                        continue;
                    }
                    if let Some(allowed) = &allowed_hrefs {
                        if !allowed.contains(&resource_id.href) {
                            continue;
                        }
                    }
                    let Some(resource) = model.as_resource() else {
                        continue;
                    };
                    sent.push(ResourceState {
                        resource_id: resource_id.clone(),
                        content: resource.content().cloned(),
                        version: resource.on_resource_changed_version(),
                    });
                }
            }

            for wanted in resource_filter {
                if devices.contains(&wanted.device_id)
                    && !sent.iter().any(|s| &s.resource_id == wanted)
                {
                    missing.push(wanted.clone());
                }
            }

            if missing.is_empty() || pass == Pass::Retry {
                for state in sent {
                    on_resource(state);
                }
                if missing.is_empty() {
                    return Ok(());
                }
                return Err(ProjectionError::NotFound(format!(
                    "resources not found: {}",
                    missing
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }

            // one bounded reload for the devices with misses, then retry
            let reload: BTreeSet<String> = missing
                .iter()
                .map(|id| id.device_id.clone())
                .collect();
            debug!(devices = ?reload, "reloading devices with missing resources");
            let reload: Vec<String> = reload.into_iter().collect();
            self.registry.reload_devices(&reload).await?;
            pass = Pass::Retry;
        }
    }

    /// Stream published links per device, optionally narrowed by resource
    /// type. Devices without published links are skipped.
    pub async fn get_resource_links(
        &self,
        device_filter: &[String],
        type_filter: &[String],
        owned: &HashSet<String>,
        mut on_links: impl FnMut(DeviceLinks),
    ) -> ProjectionResult<()> {
        let devices = Self::effective_devices(device_filter, &[], owned);
        let registered = self.register_all(&devices).await?;
        for device_id in &devices {
            let Some(model) = self.registry.model(&ResourceId::links(device_id.clone())) else {
                continue;
            };
            let Some(links) = model.as_links() else {
                continue;
            };
            let mut links = links.links_by_type(type_filter);
            if links.is_empty() {
                continue;
            }
            links.sort_by(|a, b| a.href.cmp(&b.href));
            on_links(DeviceLinks {
                device_id: device_id.clone(),
                links,
            });
        }
        self.release_all(&registered).await;
        Ok(())
    }

    /// Stream metadata per device, optionally narrowed to one connection
    /// status. Devices whose metadata aggregate has no events yet are
    /// skipped.
    pub async fn get_devices_metadata(
        &self,
        device_filter: &[String],
        status_filter: Option<ConnectionStatus>,
        owned: &HashSet<String>,
        mut on_metadata: impl FnMut(DeviceMetadataView),
    ) -> ProjectionResult<()> {
        let devices = Self::effective_devices(device_filter, &[], owned);
        let registered = self.register_all(&devices).await?;
        for device_id in &devices {
            let Some(model) = self
                .registry
                .model(&ResourceId::metadata(device_id.clone()))
            else {
                continue;
            };
            let Some(metadata) = model.as_metadata() else {
                continue;
            };
            if status_filter.is_some_and(|status| metadata.connection() != status) {
                continue;
            }
            on_metadata(DeviceMetadataView {
                device_id: device_id.clone(),
                connection: metadata.connection(),
                twin_sync: metadata.twin_sync(),
            });
        }
        self.release_all(&registered).await;
        Ok(())
    }

    /// Stream outstanding commands, narrowed by device, resource and command
    /// kind. Entries already expired are not reported.
    pub async fn get_pending_commands(
        &self,
        device_filter: &[String],
        resource_filter: &[ResourceId],
        kind_filter: &[PendingCommandKind],
        owned: &HashSet<String>,
        mut on_command: impl FnMut(PendingCommandEntry),
    ) -> ProjectionResult<()> {
        let devices = Self::effective_devices(device_filter, resource_filter, owned);
        let registered = self.register_all(&devices).await?;
        let mask = FilterBitmask::from_pending_kinds(kind_filter);
        let now = Utc::now();

        for device_id in &devices {
            for (resource_id, model) in self.registry.device_models(device_id) {
                if !resource_filter.is_empty() && !resource_filter.contains(&resource_id) {
                    continue;
                }
                let entries = match &model {
                    Model::Resource(m) => m.pending_commands(mask, now),
                    Model::Metadata(m) => m.pending_commands(mask, now),
                    Model::Links(_) => Vec::new(),
                };
                for entry in entries {
                    on_command(entry);
                }
            }
        }
        self.release_all(&registered).await;
        Ok(())
    }
}

fn is_device_scoped(href: &str) -> bool {
    href == RESOURCE_LINKS_HREF || href == DEVICE_METADATA_HREF
}

/// With a type filter, only hrefs whose published link carries one of the
/// requested types qualify; `None` means no restriction.
fn type_allowed_hrefs(
    models: &[(ResourceId, Model)],
    type_filter: &[String],
) -> Option<HashSet<String>> {
    if type_filter.is_empty() {
        return None;
    }
    let links = models
        .iter()
        .find(|(id, _)| id.href == RESOURCE_LINKS_HREF)
        .and_then(|(_, model)| model.as_links());
    let allowed = links
        .map(|links| {
            links
                .links_by_type(type_filter)
                .into_iter()
                .map(|link| link.href)
                .collect()
        })
        .unwrap_or_default();
    Some(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, InMemoryEventBus};
    use crate::config::ProjectionConfig;
    use crate::events::{Content, EventEnvelope, EventPayload, PendingCommand};
    use crate::projection::{NullObserver, ProjectionRegistry};
    use crate::store::{EventStore, InMemoryEventStore};
    use std::sync::Arc;

    fn changed(device: &str, href: &str, version: u64, power: u64) -> EventEnvelope {
        EventEnvelope::new(
            ResourceId::new(device, href),
            version,
            EventPayload::ResourceChanged(ResourceChanged {
                content: Content::json(serde_json::json!({ "power": power })),
            }),
        )
    }

    fn published(device: &str, version: u64, links: Vec<ResourceLink>) -> EventEnvelope {
        EventEnvelope::new(
            ResourceId::links(device),
            version,
            EventPayload::ResourceLinksPublished { links },
        )
    }

    fn link(href: &str, types: &[&str]) -> ResourceLink {
        ResourceLink {
            href: href.to_string(),
            resource_types: types.iter().map(|s| s.to_string()).collect(),
            interfaces: vec!["oic.if.baseline".to_string()],
        }
    }

    fn owned(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn harness() -> (Arc<InMemoryEventStore>, RegistryHandle, ResourceDirectory) {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = ProjectionRegistry::spawn(
            ProjectionConfig::default(),
            Arc::clone(&store) as Arc<dyn EventStore>,
            bus as Arc<dyn EventBus>,
            Arc::new(NullObserver),
        );
        let directory = ResourceDirectory::new(Arc::clone(&registry));
        (store, registry, directory)
    }

    #[tokio::test]
    async fn streams_shadows_of_owned_devices() {
        let (store, _registry, directory) = harness();
        store.append(changed("d1", "/light/1", 0, 1));
        store.append(changed("d2", "/light/1", 0, 2));

        let mut seen = Vec::new();
        directory
            .get_resources(&[], &[], &[], &owned(&["d1"]), |state| seen.push(state))
            .await
            .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].resource_id, ResourceId::new("d1", "/light/1"));
        assert_eq!(
            seen[0].content.as_ref().unwrap().content.data,
            serde_json::json!({ "power": 1 })
        );
    }

    #[tokio::test]
    async fn device_scoped_aggregates_are_not_resources() {
        let (store, _registry, directory) = harness();
        store.append(changed("d1", "/light/1", 0, 1));
        store.append(published("d1", 0, vec![link("/light/1", &["oic.r.light"])]));

        let mut seen = Vec::new();
        directory
            .get_resources(&[], &[], &[], &owned(&["d1"]), |state| seen.push(state))
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].resource_id.href, "/light/1");
    }

    #[tokio::test]
    async fn type_filter_uses_published_links() {
        let (store, _registry, directory) = harness();
        store.append(changed("d1", "/light/1", 0, 1));
        store.append(changed("d1", "/temp/1", 0, 21));
        store.append(published(
            "d1",
            0,
            vec![
                link("/light/1", &["oic.r.light"]),
                link("/temp/1", &["oic.r.temperature"]),
            ],
        ));

        let mut seen = Vec::new();
        directory
            .get_resources(
                &[],
                &[],
                &["oic.r.temperature".to_string()],
                &owned(&["d1"]),
                |state| seen.push(state),
            )
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].resource_id.href, "/temp/1");
    }

    #[tokio::test]
    async fn explicit_resource_appears_after_bounded_reload() {
        let (store, registry, directory) = harness();
        store.append(changed("d1", "/light/1", 0, 1));

        // warm the projection, then commit an event it has not seen
        registry.register("d1").await.unwrap();
        registry.unregister("d1").await.unwrap();
        store.append(changed("d1", "/door/1", 0, 0));

        let wanted = ResourceId::new("d1", "/door/1");
        let mut seen = Vec::new();
        directory
            .get_resources(&[], &[wanted.clone()], &[], &owned(&["d1"]), |state| {
                seen.push(state)
            })
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].resource_id, wanted);
    }

    #[tokio::test]
    async fn missing_explicit_resource_fails_after_one_reload() {
        let (store, _registry, directory) = harness();
        store.append(changed("d1", "/light/1", 0, 1));

        let calls_before = store.load_calls();
        let mut seen = Vec::new();
        let err = directory
            .get_resources(
                &[],
                &[ResourceId::new("d1", "/ghost")],
                &[],
                &owned(&["d1"]),
                |state| seen.push(state),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::NotFound(_)));
        // registration load plus exactly one reload
        assert_eq!(store.load_calls() - calls_before, 2);
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn unowned_devices_are_invisible() {
        let (store, _registry, directory) = harness();
        store.append(changed("d-other", "/light/1", 0, 1));

        let mut seen = Vec::new();
        directory
            .get_resources(
                &["d-other".to_string()],
                &[],
                &[],
                &owned(&["d1"]),
                |state| seen.push(state),
            )
            .await
            .unwrap();
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn links_and_metadata_views() {
        let (store, _registry, directory) = harness();
        store.append(published("d1", 0, vec![link("/light/1", &["oic.r.light"])]));
        store.append(EventEnvelope::new(
            ResourceId::metadata("d1"),
            0,
            EventPayload::DeviceMetadataUpdated(crate::events::MetadataUpdated {
                correlation_id: None,
                connection: ConnectionStatus::Online,
                twin_sync: TwinSyncStatus::InSync,
            }),
        ));

        let mut links = Vec::new();
        directory
            .get_resource_links(&[], &[], &owned(&["d1"]), |l| links.push(l))
            .await
            .unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].links[0].href, "/light/1");

        let mut metadata = Vec::new();
        directory
            .get_devices_metadata(&[], None, &owned(&["d1"]), |m| metadata.push(m))
            .await
            .unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].connection, ConnectionStatus::Online);
        assert_eq!(metadata[0].twin_sync, TwinSyncStatus::InSync);

        let mut offline = Vec::new();
        directory
            .get_devices_metadata(&[], Some(ConnectionStatus::Offline), &owned(&["d1"]), |m| {
                offline.push(m)
            })
            .await
            .unwrap();
        assert!(offline.is_empty());
    }

    #[tokio::test]
    async fn pending_commands_filtered_by_kind() {
        let (store, _registry, directory) = harness();
        let update = PendingCommand::new(uuid::Uuid::new_v4());
        let retrieve = PendingCommand::new(uuid::Uuid::new_v4());
        store.append(EventEnvelope::new(
            ResourceId::new("d1", "/light/1"),
            0,
            EventPayload::ResourceUpdatePending(update.clone()),
        ));
        store.append(EventEnvelope::new(
            ResourceId::new("d1", "/light/1"),
            1,
            EventPayload::ResourceRetrievePending(retrieve),
        ));

        let mut seen = Vec::new();
        directory
            .get_pending_commands(
                &[],
                &[],
                &[PendingCommandKind::ResourceUpdate],
                &owned(&["d1"]),
                |entry| seen.push(entry),
            )
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, PendingCommandKind::ResourceUpdate);
        assert_eq!(seen[0].command.correlation_id, update.correlation_id);
    }
}
