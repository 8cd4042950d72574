//! Subscription registry: fan-out of applied transitions to consumers
//!
//! Consumers open a subscription scoped to everything they own, a fixed set
//! of devices or one resource, masked by a [`FilterBitmask`]. Delivery is
//! per-subscriber ordered; a per-`(resource, kind)` version map drops the
//! duplicates that catch-up replay and bus delivery inevitably produce.
//!
//! The notify path is called under aggregate locks and must never block, so
//! each subscriber has an unbounded internal queue drained by a forwarding
//! task into the bounded client channel. A consumer that keeps its channel
//! full longer than the send timeout is torn down.

pub mod filter;

pub use filter::FilterBitmask;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProjectionConfig;
use crate::events::{EventEnvelope, EventKind, ResourceId};
use crate::projection::ProjectionObserver;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Every device the owner has registered, tracked as the set changes.
    AllDevices,
    /// A fixed set of devices.
    Devices(HashSet<String>),
    /// One resource.
    Resource(ResourceId),
}

/// Delivery unit of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// An applied aggregate transition.
    Event(EventEnvelope),
    /// Devices entered the owner's registration set. Synthesized, never
    /// version-deduplicated.
    DevicesRegistered { device_ids: Vec<String> },
    /// Devices left the owner's registration set.
    DevicesUnregistered { device_ids: Vec<String> },
    /// Terminal: the registry closed this subscription.
    Canceled { reason: String },
}

/// Open subscription handle; dropping the receiver releases it.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<SubscriptionEvent>,
}

struct Subscriber {
    id: Uuid,
    scope: SubscriptionScope,
    filter: FilterBitmask,
    queue: mpsc::UnboundedSender<SubscriptionEvent>,
    /// Highest delivered version per `(resource, kind)`.
    seen: Mutex<HashMap<(ResourceId, EventKind), u64>>,
    /// Devices this subscriber currently believes registered; only used by
    /// [`SubscriptionScope::AllDevices`].
    known_devices: Mutex<HashSet<String>>,
    /// Runs exactly once when the subscription leaves the registry, on any
    /// teardown path (close, slow consumer, receiver drop).
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscriber {
    fn run_release(&self) {
        let release = self
            .release
            .lock()
            .expect("subscriber lock poisoned")
            .take();
        if let Some(release) = release {
            release();
        }
    }

    fn matches_device(&self, device_id: &str) -> bool {
        match &self.scope {
            SubscriptionScope::AllDevices => self
                .known_devices
                .lock()
                .expect("subscriber lock poisoned")
                .contains(device_id),
            SubscriptionScope::Devices(devices) => devices.contains(device_id),
            SubscriptionScope::Resource(id) => id.device_id == device_id,
        }
    }

    fn wants(&self, event: &EventEnvelope) -> bool {
        if !self.filter.is_set(FilterBitmask::for_kind(event.kind())) {
            return false;
        }
        if let SubscriptionScope::Resource(id) = &self.scope {
            if id.href != event.resource_id.href {
                return false;
            }
        }
        self.matches_device(event.device_id())
    }

    /// Deliver unless a same-or-newer version of this `(resource, kind)` was
    /// already delivered. The version map is primed by the initial replay so
    /// the bus overlap after catch-up is silent.
    fn offer(&self, event: &EventEnvelope) {
        if !self.wants(event) {
            return;
        }
        {
            let mut seen = self.seen.lock().expect("subscriber lock poisoned");
            let key = (event.resource_id.clone(), event.kind());
            if let Some(&last) = seen.get(&key) {
                if event.version <= last {
                    debug!(
                        subscription_id = %self.id,
                        resource_id = %event.resource_id,
                        version = event.version,
                        "duplicate delivery suppressed"
                    );
                    return;
                }
            }
            seen.insert(key, event.version);
        }
        // unbounded: the forwarding task owns backpressure
        let _ = self.queue.send(SubscriptionEvent::Event(event.clone()));
    }
}

/// Registry of open subscriptions; plugs into the projection as its
/// [`ProjectionObserver`].
pub struct SubscriptionRegistry {
    config: ProjectionConfig,
    subs: Mutex<HashMap<Uuid, Arc<Subscriber>>>,
}

impl SubscriptionRegistry {
    pub fn new(config: ProjectionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            subs: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().expect("subscription lock poisoned").len()
    }

    /// Open a subscription. An empty filter means everything.
    pub fn open(self: &Arc<Self>, scope: SubscriptionScope, filter: FilterBitmask) -> Subscription {
        self.open_with_cleanup(scope, filter, || {})
    }

    /// Like [`SubscriptionRegistry::open`], with a hook that runs exactly
    /// once when the subscription leaves the registry, on any teardown path.
    pub fn open_with_cleanup(
        self: &Arc<Self>,
        scope: SubscriptionScope,
        filter: FilterBitmask,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Subscription {
        let filter = if filter.is_empty() {
            FilterBitmask::ALL
        } else {
            filter
        };
        let id = Uuid::new_v4();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::channel(self.config.subscription_buffer.max(1));

        let subscriber = Arc::new(Subscriber {
            id,
            scope,
            filter,
            queue: queue_tx,
            seen: Mutex::new(HashMap::new()),
            known_devices: Mutex::new(HashSet::new()),
            release: Mutex::new(Some(Box::new(cleanup))),
        });
        self.subs
            .lock()
            .expect("subscription lock poisoned")
            .insert(id, subscriber);
        info!(subscription_id = %id, filter = %filter, "subscription opened");

        let registry: Weak<Self> = Arc::downgrade(self);
        let send_timeout = self.config.send_timeout;
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                let terminal = matches!(event, SubscriptionEvent::Canceled { .. });
                match tokio::time::timeout(send_timeout, client_tx.send(event)).await {
                    Ok(Ok(())) if !terminal => {}
                    Ok(Ok(())) => break,
                    // receiver dropped, subscription released
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(subscription_id = %id, "slow consumer, tearing down subscription");
                        break;
                    }
                }
            }
            if let Some(registry) = registry.upgrade() {
                let removed = registry
                    .subs
                    .lock()
                    .expect("subscription lock poisoned")
                    .remove(&id);
                if let Some(removed) = removed {
                    removed.run_release();
                }
            }
        });

        Subscription {
            id,
            events: client_rx,
        }
    }

    /// Close a subscription, flushing a terminal [`SubscriptionEvent::Canceled`].
    pub fn close(&self, id: Uuid, reason: &str) {
        let subscriber = self
            .subs
            .lock()
            .expect("subscription lock poisoned")
            .remove(&id);
        if let Some(subscriber) = subscriber {
            info!(subscription_id = %id, reason, "subscription closed");
            subscriber.run_release();
            let _ = subscriber.queue.send(SubscriptionEvent::Canceled {
                reason: reason.to_owned(),
            });
        }
    }

    /// Feed current-state events to one subscription through the same
    /// de-duplication path as live delivery, priming its version map.
    pub fn replay(&self, id: Uuid, events: &[EventEnvelope]) {
        let subscriber = self
            .subs
            .lock()
            .expect("subscription lock poisoned")
            .get(&id)
            .cloned();
        if let Some(subscriber) = subscriber {
            for event in events {
                subscriber.offer(event);
            }
        }
    }

    /// Fan an applied transition out to every matching subscription.
    pub fn notify(&self, event: &EventEnvelope) {
        let subscribers: Vec<Arc<Subscriber>> = self
            .subs
            .lock()
            .expect("subscription lock poisoned")
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber.offer(event);
        }
    }

    /// Reconcile every subscription against the owner's current device set.
    /// Owner-wide subscriptions learn additions and removals as synthetic
    /// events; device- and resource-scoped subscriptions whose devices all
    /// left the set are closed.
    pub fn owner_devices_changed(&self, current: &HashSet<String>) {
        let subscribers: Vec<Arc<Subscriber>> = self
            .subs
            .lock()
            .expect("subscription lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut to_close = Vec::new();
        for subscriber in subscribers {
            match &subscriber.scope {
                SubscriptionScope::AllDevices => {
                    let (added, removed) = {
                        let mut known = subscriber
                            .known_devices
                            .lock()
                            .expect("subscriber lock poisoned");
                        let added: Vec<String> =
                            current.difference(&known).cloned().collect();
                        let removed: Vec<String> =
                            known.difference(current).cloned().collect();
                        *known = current.clone();
                        (added, removed)
                    };
                    if !added.is_empty()
                        && subscriber.filter.is_set(FilterBitmask::DEVICE_REGISTERED)
                    {
                        let mut device_ids = added;
                        device_ids.sort();
                        let _ = subscriber
                            .queue
                            .send(SubscriptionEvent::DevicesRegistered { device_ids });
                    }
                    if !removed.is_empty()
                        && subscriber.filter.is_set(FilterBitmask::DEVICE_UNREGISTERED)
                    {
                        let mut device_ids = removed;
                        device_ids.sort();
                        let _ = subscriber
                            .queue
                            .send(SubscriptionEvent::DevicesUnregistered { device_ids });
                    }
                }
                SubscriptionScope::Devices(devices) => {
                    if devices.iter().all(|d| !current.contains(d)) {
                        to_close.push(subscriber.id);
                    }
                }
                SubscriptionScope::Resource(id) => {
                    if !current.contains(&id.device_id) {
                        to_close.push(subscriber.id);
                    }
                }
            }
        }
        for id in to_close {
            self.close(id, "device is no longer registered");
        }
    }
}

impl ProjectionObserver for SubscriptionRegistry {
    fn on_event(&self, event: &EventEnvelope) {
        self.notify(event);
    }
}
