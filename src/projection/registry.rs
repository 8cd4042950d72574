//! Reference-counted device registration with TTL eviction.
//!
//! Consumers register the devices they care about; the registry subscribes
//! to each device's bus topic, catches the projection up from the store and
//! keeps folding live deliveries through a bounded worker pool. When the
//! last registration is released the device is not dropped immediately but
//! parked until the cache expiration elapses, so a reconnecting consumer
//! finds warm state.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{BusHandler, BusSubscription, EventBus};
use crate::config::ProjectionConfig;
use crate::errors::{ProjectionError, ProjectionResult};
use crate::events::{EventEnvelope, ResourceId};
use crate::model::Model;
use crate::projection::{Projection, ProjectionObserver};
use crate::store::{AggregateQuery, EventStore};
use crate::topics;

struct DeviceEntry {
    refcount: usize,
    /// `None` until the first registrant finishes the bus subscription and
    /// store catch-up.
    subscription: Option<BusSubscription>,
    /// Set while the refcount is zero; the sweeper evicts past this point.
    expires_at: Option<Instant>,
}

impl DeviceEntry {
    fn empty() -> Self {
        Self {
            refcount: 0,
            subscription: None,
            expires_at: None,
        }
    }
}

/// One device's registration state. The map lock is only held for
/// bookkeeping; the catch-up I/O of a first registration runs under the
/// slot lock, so loading one device never blocks another. Map critical
/// sections must not await a slot lock.
type DeviceSlot = Arc<Mutex<DeviceEntry>>;

/// Handle to the shared registry; cheap to clone.
pub type RegistryHandle = Arc<ProjectionRegistry>;

pub struct ProjectionRegistry {
    config: ProjectionConfig,
    bus: Arc<dyn EventBus>,
    projection: Arc<Projection>,
    devices: Mutex<HashMap<String, DeviceSlot>>,
    pool_tx: mpsc::Sender<Vec<EventEnvelope>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Bus handler that feeds delivered batches into the fold worker pool.
struct PoolFeeder {
    tx: mpsc::Sender<Vec<EventEnvelope>>,
}

#[async_trait::async_trait]
impl BusHandler for PoolFeeder {
    async fn handle(&self, events: Vec<EventEnvelope>) {
        if self.tx.send(events).await.is_err() {
            debug!("fold pool closed, dropping delivery");
        }
    }
}

impl ProjectionRegistry {
    /// Spawn the registry with its fold workers and eviction sweeper.
    pub fn spawn(
        config: ProjectionConfig,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        observer: Arc<dyn ProjectionObserver>,
    ) -> RegistryHandle {
        let (pool_tx, pool_rx) = mpsc::channel(config.pool_size.max(1) * 2);
        let registry = Arc::new(Self {
            config,
            bus,
            projection: Arc::new(Projection::new(store, observer)),
            devices: Mutex::new(HashMap::new()),
            pool_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let pool_rx = Arc::new(Mutex::new(pool_rx));
        let mut tasks = Vec::with_capacity(registry.config.pool_size + 1);
        for worker in 0..registry.config.pool_size.max(1) {
            let projection = Arc::clone(&registry.projection);
            let pool_rx = Arc::clone(&pool_rx);
            tasks.push(tokio::spawn(async move {
                loop {
                    let batch = { pool_rx.lock().await.recv().await };
                    let Some(batch) = batch else { break };
                    if let Err(err) = projection.apply(batch).await {
                        warn!(worker, error = %err, "fold worker failed to apply batch");
                    }
                }
            }));
        }
        tasks.push(tokio::spawn(Self::sweep_loop(Arc::downgrade(&registry))));
        *registry.tasks.lock().expect("task list poisoned") = tasks;
        registry
    }

    async fn sweep_loop(registry: Weak<ProjectionRegistry>) {
        let period = match registry.upgrade() {
            Some(registry) => registry.config.sweep_period(),
            None => return,
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else { break };
            registry.sweep(Instant::now()).await;
        }
    }

    /// Evict devices whose grace period has elapsed.
    async fn sweep(&self, now: Instant) {
        let slots: Vec<(String, DeviceSlot)> = {
            let devices = self.devices.lock().await;
            devices
                .iter()
                .map(|(device_id, slot)| (device_id.clone(), Arc::clone(slot)))
                .collect()
        };
        for (device_id, slot) in slots {
            let mut entry = slot.lock().await;
            let due = entry.refcount == 0
                && entry.expires_at.is_some_and(|expires_at| expires_at <= now);
            if !due {
                continue;
            }
            if let Some(subscription) = entry.subscription.take() {
                subscription.close();
            }
            // unmap while still holding the slot so a concurrent register
            // cannot revive a slot the map no longer points at
            self.unmap_slot(&device_id, &slot).await;
            info!(device_id = %device_id, "evicting expired device projection");
            self.projection.forget_device(&device_id);
        }
    }

    /// The mapped slot for a device, created empty when absent.
    async fn slot(&self, device_id: &str) -> DeviceSlot {
        let mut devices = self.devices.lock().await;
        Arc::clone(
            devices
                .entry(device_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(DeviceEntry::empty()))),
        )
    }

    /// Remove a device's mapping, but only if it still points at `slot`.
    async fn unmap_slot(&self, device_id: &str, slot: &DeviceSlot) {
        let mut devices = self.devices.lock().await;
        if devices
            .get(device_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            devices.remove(device_id);
        }
    }

    /// Register interest in a device. The first registrant subscribes to
    /// the device's bus topic before the store catch-up so no delivery can
    /// fall between the two; the version gate drops the overlap. Returns
    /// whether the device was already loaded.
    pub async fn register(&self, device_id: &str) -> ProjectionResult<bool> {
        loop {
            let slot = self.slot(device_id).await;
            let mut entry = slot.lock().await;
            if entry.subscription.is_some() {
                entry.refcount += 1;
                entry.expires_at = None;
                return Ok(true);
            }
            // a failed first registrant or the sweeper may have unmapped
            // this slot while we waited for its lock
            {
                let devices = self.devices.lock().await;
                if !devices
                    .get(device_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    continue;
                }
            }

            let subscription = match self
                .bus
                .subscribe(
                    &topics::device_events(device_id),
                    Arc::new(PoolFeeder {
                        tx: self.pool_tx.clone(),
                    }),
                )
                .await
            {
                Ok(subscription) => subscription,
                Err(err) => {
                    self.unmap_slot(device_id, &slot).await;
                    return Err(err);
                }
            };
            if let Err(err) = self
                .projection
                .load(&[AggregateQuery::device(device_id)])
                .await
            {
                subscription.close();
                self.projection.forget_device(device_id);
                self.unmap_slot(device_id, &slot).await;
                return Err(err);
            }
            debug!(device_id = %device_id, "device registered");
            entry.refcount = 1;
            entry.subscription = Some(subscription);
            entry.expires_at = None;
            return Ok(false);
        }
    }

    /// Release one registration. The device stays warm for the cache
    /// expiration before the sweeper evicts it.
    pub async fn unregister(&self, device_id: &str) -> ProjectionResult<()> {
        let slot = {
            let devices = self.devices.lock().await;
            devices.get(device_id).map(Arc::clone)
        }
        .ok_or_else(|| {
            ProjectionError::NotFound(format!("device {device_id} is not registered"))
        })?;
        let mut entry = slot.lock().await;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            entry.expires_at = Some(Instant::now() + self.config.cache_expiration);
        }
        Ok(())
    }

    /// Synchronous catch-up replay from the store, regardless of what the
    /// bus has delivered. With an href the replay narrows to that one
    /// aggregate, otherwise the whole device is refreshed.
    pub async fn force_update(
        &self,
        device_id: &str,
        href: Option<&str>,
    ) -> ProjectionResult<()> {
        let query = match href {
            Some(href) => AggregateQuery::aggregate(&ResourceId::new(device_id, href)),
            None => AggregateQuery::device(device_id),
        };
        self.projection.load(&[query]).await
    }

    /// Bring a set of devices up to date with the store: load devices that
    /// were never registered, force-update those that were. Registrations
    /// taken here are released again, leaving the models warm.
    pub async fn reload_devices(&self, device_ids: &[String]) -> ProjectionResult<()> {
        for device_id in device_ids {
            let already_loaded = self.register(device_id).await?;
            if already_loaded {
                if let Err(err) = self.force_update(device_id, None).await {
                    let _ = self.unregister(device_id).await;
                    return Err(err);
                }
            }
            self.unregister(device_id).await?;
        }
        Ok(())
    }

    /// Current registration count of a device, `None` when unknown. Zero
    /// means the device is parked awaiting eviction.
    pub async fn registration_count(&self, device_id: &str) -> Option<usize> {
        let slot = {
            let devices = self.devices.lock().await;
            devices.get(device_id).map(Arc::clone)
        }?;
        let entry = slot.lock().await;
        Some(entry.refcount)
    }

    pub fn model(&self, resource_id: &ResourceId) -> Option<Model> {
        self.projection.model(resource_id)
    }

    pub fn device_models(&self, device_id: &str) -> Vec<(ResourceId, Model)> {
        self.projection.device_models(device_id)
    }

    /// Current-state events of a device, suitable for seeding a new
    /// subscription; see [`Projection::replay_events`].
    pub fn replay_events(&self, device_id: &str) -> Vec<EventEnvelope> {
        self.projection.replay_events(device_id)
    }

    /// Stop the workers and sweeper and drop every bus subscription.
    pub async fn shutdown(&self) {
        let slots: Vec<DeviceSlot> = {
            let mut devices = self.devices.lock().await;
            devices.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let mut entry = slot.lock().await;
            if let Some(subscription) = entry.subscription.take() {
                subscription.close();
            }
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list poisoned"));
        for task in tasks {
            task.abort();
        }
    }
}
