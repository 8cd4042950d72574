//! Event-sourced projection of device aggregates
//!
//! [`Projection`] owns the live models keyed `device -> href`, folds store
//! and bus deliveries through a per-aggregate version gate and hands every
//! applied transition to a [`ProjectionObserver`]. The reference-counted,
//! TTL-evicting registry on top lives in [`registry`].
//!
//! Locking is two-tiered: the aggregate map has one registry-level lock for
//! structural changes, each aggregate has its own lock for folds, so one
//! device's fold never blocks another device's bookkeeping. Neither lock is
//! ever held across I/O.

pub mod registry;

pub use registry::{ProjectionRegistry, RegistryHandle};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::{ProjectionError, ProjectionResult};
use crate::events::{EventEnvelope, ResourceId};
use crate::model::Model;
use crate::store::{AggregateQuery, EventStore};

/// Receives every state-affecting transition after a successful fold.
///
/// Called under the aggregate lock, so implementations must not block; the
/// subscription registry only enqueues.
pub trait ProjectionObserver: Send + Sync {
    fn on_event(&self, event: &EventEnvelope);
}

/// Observer that drops everything; useful for tests and plain read replicas.
pub struct NullObserver;

impl ProjectionObserver for NullObserver {
    fn on_event(&self, _event: &EventEnvelope) {}
}

/// Outcome of gating one event against an aggregate's version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Accept,
    Ignore,
    /// A version gap was detected; the aggregate must be reloaded from the
    /// store before newer events can be applied.
    Reload,
}

/// Where a batch of events came from. A store replay is authoritative: its
/// first event anchors an aggregate that has no baseline yet, so streams
/// whose retained history starts above version zero still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Bus,
    Store,
}

/// One live aggregate: model state plus the version gate.
struct Aggregate {
    resource_id: ResourceId,
    version: u64,
    /// Whether the fold has seen a baseline (version 0, a snapshot, or the
    /// head of a store replay); only then are incremental versions trusted
    /// and stale versions ignored.
    has_baseline: bool,
    model: Model,
}

impl Aggregate {
    fn new(resource_id: ResourceId) -> Self {
        let model = Model::new_for(&resource_id.href);
        Self {
            resource_id,
            version: 0,
            has_baseline: false,
            model,
        }
    }

    fn gate(&self, event: &EventEnvelope, origin: Origin) -> Gate {
        if !self.has_baseline {
            if event.version == 0 || event.is_snapshot() || origin == Origin::Store {
                Gate::Accept
            } else {
                Gate::Reload
            }
        } else if event.is_snapshot() && event.version > self.version {
            Gate::Accept
        } else if event.version == self.version + 1 {
            Gate::Accept
        } else if event.version <= self.version {
            Gate::Ignore
        } else {
            Gate::Reload
        }
    }

    /// Gate and fold one event; returns the gate outcome.
    fn fold(&mut self, event: &EventEnvelope, origin: Origin) -> Gate {
        let gate = self.gate(event, origin);
        match gate {
            Gate::Accept => {
                self.version = event.version;
                self.has_baseline = true;
                self.model.apply(event);
            }
            Gate::Ignore => {
                debug!(
                    resource_id = %self.resource_id,
                    version = event.version,
                    current = self.version,
                    "stale event ignored"
                );
            }
            Gate::Reload => {}
        }
        gate
    }
}

type AggregateMap = HashMap<String, HashMap<String, Arc<Mutex<Aggregate>>>>;

/// Materialized view over the event store, kept live by bus deliveries.
pub struct Projection {
    store: Arc<dyn EventStore>,
    observer: Arc<dyn ProjectionObserver>,
    aggregates: RwLock<AggregateMap>,
}

impl Projection {
    pub fn new(store: Arc<dyn EventStore>, observer: Arc<dyn ProjectionObserver>) -> Self {
        Self {
            store,
            observer,
            aggregates: RwLock::new(HashMap::new()),
        }
    }

    fn aggregate(&self, resource_id: &ResourceId) -> Arc<Mutex<Aggregate>> {
        {
            let aggregates = self.aggregates.read().expect("projection lock poisoned");
            if let Some(agg) = aggregates
                .get(&resource_id.device_id)
                .and_then(|device| device.get(&resource_id.href))
            {
                return Arc::clone(agg);
            }
        }
        let mut aggregates = self.aggregates.write().expect("projection lock poisoned");
        Arc::clone(
            aggregates
                .entry(resource_id.device_id.clone())
                .or_default()
                .entry(resource_id.href.clone())
                .or_insert_with(|| {
                    debug!(resource_id = %resource_id, "new model");
                    Arc::new(Mutex::new(Aggregate::new(resource_id.clone())))
                }),
        )
    }

    /// Fold a batch of events, reloading any aggregate whose stream shows a
    /// version gap. Fold failures are isolated per aggregate: a corrupt
    /// stream for one resource does not block the rest of the batch.
    pub(crate) async fn apply(&self, events: Vec<EventEnvelope>) -> ProjectionResult<()> {
        self.apply_from(events, Origin::Bus).await
    }

    async fn apply_from(&self, events: Vec<EventEnvelope>, origin: Origin) -> ProjectionResult<()> {
        let mut by_aggregate: HashMap<ResourceId, Vec<EventEnvelope>> = HashMap::new();
        for event in events {
            by_aggregate
                .entry(event.resource_id.clone())
                .or_default()
                .push(event);
        }

        let mut first_err = None;
        for (resource_id, batch) in by_aggregate {
            if let Err(err) = self.apply_one(&resource_id, batch, origin).await {
                warn!(resource_id = %resource_id, error = %err, "fold failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn apply_one(
        &self,
        resource_id: &ResourceId,
        batch: Vec<EventEnvelope>,
        origin: Origin,
    ) -> ProjectionResult<()> {
        let needs_reload = self.fold_batch(resource_id, &batch, origin);
        if needs_reload {
            debug!(resource_id = %resource_id, "version gap, reloading from store");
            let events = self
                .store
                .load(&[AggregateQuery::aggregate(resource_id)])
                .await?;
            if self.fold_batch(resource_id, &events, Origin::Store) {
                return Err(ProjectionError::Store(format!(
                    "aggregate {} still has a version gap after reload",
                    resource_id
                )));
            }
        }
        self.check_vacant(resource_id)
    }

    /// Fold events into one aggregate under its lock; returns whether a
    /// reload is required.
    fn fold_batch(&self, resource_id: &ResourceId, events: &[EventEnvelope], origin: Origin) -> bool {
        let aggregate = self.aggregate(resource_id);
        let mut aggregate = aggregate.lock().expect("aggregate lock poisoned");
        for event in events {
            match aggregate.fold(event, origin) {
                Gate::Accept => self.observer.on_event(event),
                Gate::Ignore => {}
                Gate::Reload => return true,
            }
        }
        false
    }

    /// A model that stayed vacant after folding events is corrupt state in
    /// the store; it must surface as "not found", so drop it.
    fn check_vacant(&self, resource_id: &ResourceId) -> ProjectionResult<()> {
        let vacant = {
            let aggregate = self.aggregate(resource_id);
            let aggregate = aggregate.lock().expect("aggregate lock poisoned");
            aggregate.has_baseline && aggregate.model.is_vacant()
        };
        if vacant {
            self.forget_aggregate(resource_id);
            return Err(ProjectionError::EmptyAggregate(resource_id.clone()));
        }
        Ok(())
    }

    /// Synchronous catch-up replay from the store for the given queries.
    pub(crate) async fn load(&self, queries: &[AggregateQuery]) -> ProjectionResult<()> {
        let events = self.store.load(queries).await?;
        self.apply_from(events, Origin::Store).await
    }

    /// Clone-on-read: the model for one aggregate, if it has folded state.
    pub fn model(&self, resource_id: &ResourceId) -> Option<Model> {
        let aggregates = self.aggregates.read().expect("projection lock poisoned");
        let aggregate = aggregates
            .get(&resource_id.device_id)?
            .get(&resource_id.href)?;
        let aggregate = aggregate.lock().expect("aggregate lock poisoned");
        if aggregate.model.is_vacant() {
            return None;
        }
        Some(aggregate.model.clone())
    }

    /// Clone-on-read: all non-vacant models of one device.
    pub fn device_models(&self, device_id: &str) -> Vec<(ResourceId, Model)> {
        let aggregates = self.aggregates.read().expect("projection lock poisoned");
        let Some(device) = aggregates.get(device_id) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(device.len());
        for aggregate in device.values() {
            let aggregate = aggregate.lock().expect("aggregate lock poisoned");
            if !aggregate.model.is_vacant() {
                out.push((aggregate.resource_id.clone(), aggregate.model.clone()));
            }
        }
        out
    }

    /// Synthetic current-state events for one device, versioned so that
    /// feeding them through a subscription primes its de-duplication map
    /// against the live stream.
    pub fn replay_events(&self, device_id: &str) -> Vec<EventEnvelope> {
        let aggregates = self.aggregates.read().expect("projection lock poisoned");
        let Some(device) = aggregates.get(device_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for aggregate in device.values() {
            let aggregate = aggregate.lock().expect("aggregate lock poisoned");
            if aggregate.model.is_vacant() {
                continue;
            }
            match &aggregate.model {
                Model::Resource(resource) => {
                    if let Some(change) = resource.content() {
                        out.push(EventEnvelope::new(
                            aggregate.resource_id.clone(),
                            resource.on_resource_changed_version(),
                            crate::events::EventPayload::ResourceChanged(change.clone()),
                        ));
                    }
                }
                Model::Links(links) => {
                    out.push(EventEnvelope::new(
                        aggregate.resource_id.clone(),
                        aggregate.version,
                        crate::events::EventPayload::ResourceLinksSnapshotTaken {
                            links: links.links_by_type(&[]),
                        },
                    ));
                }
                Model::Metadata(metadata) => {
                    out.push(EventEnvelope::new(
                        aggregate.resource_id.clone(),
                        aggregate.version,
                        crate::events::EventPayload::DeviceMetadataSnapshotTaken(
                            crate::events::DeviceMetadataSnapshot {
                                connection: metadata.connection(),
                                twin_sync: metadata.twin_sync(),
                                update_pendings: metadata.update_pendings().to_vec(),
                            },
                        ),
                    ));
                }
            }
        }
        out.sort_by(|a, b| a.resource_id.href.cmp(&b.resource_id.href));
        out
    }

    /// Drop every model of a device (eviction).
    pub(crate) fn forget_device(&self, device_id: &str) {
        let mut aggregates = self.aggregates.write().expect("projection lock poisoned");
        aggregates.remove(device_id);
    }

    fn forget_aggregate(&self, resource_id: &ResourceId) {
        let mut aggregates = self.aggregates.write().expect("projection lock poisoned");
        if let Some(device) = aggregates.get_mut(&resource_id.device_id) {
            device.remove(&resource_id.href);
            if device.is_empty() {
                aggregates.remove(&resource_id.device_id);
            }
        }
    }
}
