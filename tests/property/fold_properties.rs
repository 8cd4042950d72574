//! Property-based tests for the projection fold
//!
//! Each case builds a fresh store, registers the device and checks the
//! materialized view against a simple reference fold of the same stream.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use uuid::Uuid;

use hub_projection::{
    events::ResourceChanged, Content, EventBus, EventEnvelope, EventPayload, EventStore,
    InMemoryEventBus, InMemoryEventStore, ProjectionConfig, ProjectionRegistry, RegistryHandle,
    ResourceId, ResourceLink,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

fn harness() -> (Arc<InMemoryEventStore>, RegistryHandle) {
    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let registry = ProjectionRegistry::spawn(
        ProjectionConfig::default(),
        Arc::clone(&store) as Arc<dyn EventStore>,
        bus as Arc<dyn EventBus>,
        Arc::new(hub_projection::projection::NullObserver),
    );
    (store, registry)
}

fn changed(device: &str, href: &str, version: u64, power: u64) -> EventEnvelope {
    EventEnvelope::new(
        ResourceId::new(device, href),
        version,
        EventPayload::ResourceChanged(ResourceChanged {
            content: Content::json(serde_json::json!({ "power": power })),
        }),
    )
}

proptest! {
    /// The shadow always equals the highest-versioned change of the stream.
    #[test]
    fn shadow_matches_last_change(powers in prop::collection::vec(0u64..1000, 1..16)) {
        runtime().block_on(async {
            let (store, registry) = harness();
            for (version, power) in powers.iter().enumerate() {
                store.append(changed("d1", "/light/1", version as u64, *power));
            }
            registry.register("d1").await.unwrap();

            let model = registry
                .model(&ResourceId::new("d1", "/light/1"))
                .expect("model after register");
            let resource = model.as_resource().unwrap();
            prop_assert_eq!(
                resource.on_resource_changed_version(),
                powers.len() as u64 - 1
            );
            prop_assert_eq!(
                &resource.content().unwrap().content.data,
                &serde_json::json!({ "power": *powers.last().unwrap() })
            );
            registry.shutdown().await;
            Ok(())
        })?;
    }

    /// Replaying the stream again, any number of times, never moves the view.
    #[test]
    fn repeated_catchup_is_idempotent(
        powers in prop::collection::vec(0u64..1000, 1..12),
        replays in 1usize..4,
    ) {
        runtime().block_on(async {
            let (store, registry) = harness();
            for (version, power) in powers.iter().enumerate() {
                store.append(changed("d1", "/light/1", version as u64, *power));
            }
            registry.register("d1").await.unwrap();
            let before = registry
                .model(&ResourceId::new("d1", "/light/1"))
                .unwrap()
                .as_resource()
                .unwrap()
                .clone();

            for _ in 0..replays {
                registry.force_update("d1", None).await.unwrap();
            }
            let after = registry
                .model(&ResourceId::new("d1", "/light/1"))
                .unwrap()
                .as_resource()
                .unwrap()
                .clone();
            prop_assert_eq!(before.on_resource_changed_version(), after.on_resource_changed_version());
            prop_assert_eq!(before.content(), after.content());
            registry.shutdown().await;
            Ok(())
        })?;
    }

    /// The links view matches a naive fold of publish/unpublish operations.
    #[test]
    fn links_match_reference_fold(
        ops in prop::collection::vec((any::<bool>(), 0u8..6), 1..20),
    ) {
        runtime().block_on(async {
            let (store, registry) = harness();
            let mut reference: HashMap<String, ResourceLink> = HashMap::new();
            for (version, (publish, slot)) in ops.iter().enumerate() {
                let href = format!("/res/{slot}");
                let payload = if *publish {
                    let link = ResourceLink {
                        href: href.clone(),
                        resource_types: vec!["x.example.type".to_string()],
                        interfaces: Vec::new(),
                    };
                    reference.insert(href.clone(), link.clone());
                    EventPayload::ResourceLinksPublished { links: vec![link] }
                } else {
                    reference.remove(&href);
                    EventPayload::ResourceLinksUnpublished { hrefs: vec![href] }
                };
                store.append(EventEnvelope::new(
                    ResourceId::links("d1"),
                    version as u64,
                    payload,
                ));
            }
            registry.register("d1").await.unwrap();

            let model = registry.model(&ResourceId::links("d1")).unwrap();
            let links = model.as_links().unwrap();
            prop_assert_eq!(links.resources(), &reference);
            registry.shutdown().await;
            Ok(())
        })?;
    }

    /// Outstanding commands are exactly the pendings without a terminal.
    #[test]
    fn pendings_without_terminal_stay_outstanding(
        total in 1usize..8,
        done in 0usize..8,
    ) {
        runtime().block_on(async {
            let (store, registry) = harness();
            let ids: Vec<Uuid> = (0..total).map(|_| Uuid::new_v4()).collect();
            let mut version = 0u64;
            for id in &ids {
                store.append(EventEnvelope::new(
                    ResourceId::new("d1", "/light/1"),
                    version,
                    EventPayload::ResourceUpdatePending(
                        hub_projection::PendingCommand::new(*id),
                    ),
                ));
                version += 1;
            }
            for id in ids.iter().take(done) {
                store.append(EventEnvelope::new(
                    ResourceId::new("d1", "/light/1"),
                    version,
                    EventPayload::ResourceUpdated(hub_projection::events::CommandDone {
                        correlation_id: *id,
                        status: hub_projection::events::CommandStatus::Ok,
                    }),
                ));
                version += 1;
            }
            registry.register("d1").await.unwrap();

            let model = registry.model(&ResourceId::new("d1", "/light/1")).unwrap();
            let outstanding = model.as_resource().unwrap().pending_commands(
                hub_projection::FilterBitmask::ALL_PENDING,
                chrono::Utc::now(),
            );
            prop_assert_eq!(outstanding.len(), total.saturating_sub(done));
            registry.shutdown().await;
            Ok(())
        })?;
    }
}
