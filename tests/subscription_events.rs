//! End-to-end subscription scenarios
//!
//! Wires the subscription registry in as the projection observer and checks
//! that applied transitions, synthetic registration events and cancellation
//! behave as a consumer of the event stream would observe them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hub_projection::{
    events::{MetadataUpdated, ResourceChanged},
    topics, ConnectionStatus, Content, EventBus, EventEnvelope, EventPayload, EventStore,
    FilterBitmask, InMemoryEventBus, InMemoryEventStore, ProjectionConfig, ProjectionRegistry,
    RegistryHandle, ResourceId, Subscription, SubscriptionEvent, SubscriptionRegistry,
    SubscriptionScope, TwinSyncStatus,
};
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;

fn changed(device: &str, href: &str, version: u64, power: u64) -> EventEnvelope {
    EventEnvelope::new(
        ResourceId::new(device, href),
        version,
        EventPayload::ResourceChanged(ResourceChanged {
            content: Content::json(serde_json::json!({ "power": power })),
        }),
    )
}

fn online(device: &str, version: u64) -> EventEnvelope {
    EventEnvelope::new(
        ResourceId::metadata(device),
        version,
        EventPayload::DeviceMetadataUpdated(MetadataUpdated {
            correlation_id: None,
            connection: ConnectionStatus::Online,
            twin_sync: TwinSyncStatus::InSync,
        }),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness() -> (
    Arc<InMemoryEventStore>,
    Arc<InMemoryEventBus>,
    Arc<SubscriptionRegistry>,
    RegistryHandle,
) {
    init_tracing();
    let config = ProjectionConfig::default();
    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let subscriptions = SubscriptionRegistry::new(config.clone());
    let registry = ProjectionRegistry::spawn(
        config,
        Arc::clone(&store) as Arc<dyn EventStore>,
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::clone(&subscriptions) as Arc<dyn hub_projection::ProjectionObserver>,
    );
    (store, bus, subscriptions, registry)
}

async fn next(sub: &mut Subscription) -> SubscriptionEvent {
    tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
        .await
        .expect("timed out waiting for subscription event")
        .expect("subscription channel closed")
}

fn devices(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn catchup_fold_reaches_open_subscription() {
    let (store, _bus, subs, registry) = harness();
    let mut sub = subs.open(
        SubscriptionScope::Devices(devices(&["d1"])),
        FilterBitmask::RESOURCE_CHANGED,
    );

    // registration replays the store through the observer
    store.append(changed("d1", "/light/1", 0, 7));
    registry.register("d1").await.unwrap();

    match next(&mut sub).await {
        SubscriptionEvent::Event(event) => {
            assert_eq!(event.resource_id, ResourceId::new("d1", "/light/1"));
            assert_eq!(event.version, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn device_coming_online_is_observed_end_to_end() {
    let (store, bus, subs, registry) = harness();
    store.append(changed("d1", "/light/1", 0, 0));
    tokio_test::assert_ok!(registry.register("d1").await);

    let mut sub = subs.open(
        SubscriptionScope::Devices(devices(&["d1"])),
        FilterBitmask::DEVICE_METADATA_UPDATED,
    );

    store.append(online("d1", 0));
    bus.publish(&topics::device_events("d1"), &[online("d1", 0)])
        .await
        .unwrap();

    match next(&mut sub).await {
        SubscriptionEvent::Event(event) => {
            assert_eq!(event.resource_id, ResourceId::metadata("d1"));
            match event.payload {
                EventPayload::DeviceMetadataUpdated(updated) => {
                    assert_eq!(updated.connection, ConnectionStatus::Online);
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
        other => panic!("unexpected event {other:?}"),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn filter_drops_unrequested_kinds() {
    let (store, bus, subs, registry) = harness();
    store.append(changed("d1", "/light/1", 0, 0));
    registry.register("d1").await.unwrap();

    let mut sub = subs.open(
        SubscriptionScope::Devices(devices(&["d1"])),
        FilterBitmask::DEVICE_METADATA_UPDATED,
    );

    bus.publish(
        &topics::device_events("d1"),
        &[changed("d1", "/light/1", 1, 1), online("d1", 0)],
    )
    .await
    .unwrap();

    // only the metadata update comes through
    match next(&mut sub).await {
        SubscriptionEvent::Event(event) => {
            assert_eq!(event.resource_id, ResourceId::metadata("d1"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn owner_wide_subscription_tracks_registration_set() {
    let (store, bus, subs, registry) = harness();
    let mut sub = subs.open(SubscriptionScope::AllDevices, FilterBitmask::NONE);

    // owner acquires d1
    store.append(changed("d1", "/light/1", 0, 0));
    registry.register("d1").await.unwrap();
    subs.owner_devices_changed(&devices(&["d1"]));

    match next(&mut sub).await {
        SubscriptionEvent::DevicesRegistered { device_ids } => {
            assert_eq!(device_ids, vec!["d1".to_string()]);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // live traffic for the tracked device flows
    bus.publish(&topics::device_events("d1"), &[changed("d1", "/light/1", 1, 1)])
        .await
        .unwrap();
    match next(&mut sub).await {
        SubscriptionEvent::Event(event) => assert_eq!(event.version, 1),
        other => panic!("unexpected event {other:?}"),
    }

    // owner loses d1
    subs.owner_devices_changed(&devices(&[]));
    match next(&mut sub).await {
        SubscriptionEvent::DevicesUnregistered { device_ids } => {
            assert_eq!(device_ids, vec!["d1".to_string()]);
        }
        other => panic!("unexpected event {other:?}"),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn resource_subscription_ends_when_device_is_removed() {
    let (store, _bus, subs, registry) = harness();
    store.append(changed("d1", "/light/1", 0, 0));
    registry.register("d1").await.unwrap();
    subs.owner_devices_changed(&devices(&["d1"]));

    let mut sub = subs.open(
        SubscriptionScope::Resource(ResourceId::new("d1", "/light/1")),
        FilterBitmask::ALL,
    );
    subs.replay(sub.id, &registry.replay_events("d1"));
    match next(&mut sub).await {
        SubscriptionEvent::Event(event) => assert_eq!(event.href(), "/light/1"),
        other => panic!("unexpected event {other:?}"),
    }

    subs.owner_devices_changed(&devices(&[]));
    match next(&mut sub).await {
        SubscriptionEvent::Canceled { reason } => {
            assert_eq!(reason, "device is no longer registered");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(
        tokio::time::timeout(Duration::from_secs(1), sub.events.recv())
            .await
            .unwrap()
            .is_none()
    );
    registry.shutdown().await;
}
