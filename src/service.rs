//! Service facade wiring projection, subscriptions and queries together
//!
//! [`ProjectionService`] owns the registry pair and the query directory for
//! one verified owner context: callers hand it the owner's current device
//! set, open subscriptions against it and read through the directory. Device
//! registrations follow subscription lifetimes, so a subscription keeps its
//! devices' bus topics attached until it is torn down.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::bus::EventBus;
use crate::config::ProjectionConfig;
use crate::errors::{ProjectionError, ProjectionResult};
use crate::projection::{ProjectionRegistry, RegistryHandle};
use crate::query::ResourceDirectory;
use crate::store::EventStore;
use crate::subscription::{
    FilterBitmask, Subscription, SubscriptionRegistry, SubscriptionScope,
};

pub struct ProjectionService {
    registry: RegistryHandle,
    subscriptions: Arc<SubscriptionRegistry>,
    directory: ResourceDirectory,
    owner_devices: Mutex<HashSet<String>>,
}

impl ProjectionService {
    pub fn new(
        config: ProjectionConfig,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let subscriptions = SubscriptionRegistry::new(config.clone());
        let registry = ProjectionRegistry::spawn(
            config,
            store,
            bus,
            Arc::clone(&subscriptions) as Arc<dyn crate::projection::ProjectionObserver>,
        );
        let directory = ResourceDirectory::new(Arc::clone(&registry));
        Self {
            registry,
            subscriptions,
            directory,
            owner_devices: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn directory(&self) -> &ResourceDirectory {
        &self.directory
    }

    /// Devices the owner is currently authorized for, as last set.
    pub async fn owner_devices(&self) -> HashSet<String> {
        self.owner_devices.lock().await.clone()
    }

    /// Replace the owner's device set. Owner-wide subscriptions learn the
    /// difference as synthetic registration events; subscriptions scoped to
    /// removed devices are closed.
    pub async fn set_owner_devices(&self, devices: HashSet<String>) {
        {
            let mut owned = self.owner_devices.lock().await;
            if *owned == devices {
                return;
            }
            info!(count = devices.len(), "owner device set changed");
            *owned = devices.clone();
        }
        self.subscriptions.owner_devices_changed(&devices);
    }

    /// Open a subscription for the owner. The scope's devices are registered
    /// with the projection and stay registered until the subscription is
    /// torn down; with `include_current_state` the materialized state is
    /// replayed into the subscription before live deltas.
    pub async fn subscribe(
        &self,
        scope: SubscriptionScope,
        filter: FilterBitmask,
        include_current_state: bool,
    ) -> ProjectionResult<Subscription> {
        let owned = self.owner_devices.lock().await.clone();
        let devices: Vec<String> = match &scope {
            SubscriptionScope::AllDevices => owned.iter().cloned().collect(),
            SubscriptionScope::Devices(requested) => {
                requested.intersection(&owned).cloned().collect()
            }
            SubscriptionScope::Resource(id) => {
                if !owned.contains(&id.device_id) {
                    return Err(ProjectionError::NotFound(format!(
                        "device {} is not registered for this owner",
                        id.device_id
                    )));
                }
                vec![id.device_id.clone()]
            }
        };

        let mut registered = Vec::with_capacity(devices.len());
        for device_id in &devices {
            match self.registry.register(device_id).await {
                Ok(_) => registered.push(device_id.clone()),
                Err(err) => {
                    for device_id in &registered {
                        let _ = self.registry.unregister(device_id).await;
                    }
                    return Err(err);
                }
            }
        }

        let registry = Arc::clone(&self.registry);
        let held = registered.clone();
        let subscription = self
            .subscriptions
            .open_with_cleanup(scope, filter, move || {
                tokio::spawn(async move {
                    for device_id in held {
                        let _ = registry.unregister(&device_id).await;
                    }
                });
            });

        // owner-wide subscriptions start from the current set
        self.subscriptions.owner_devices_changed(&owned);
        if include_current_state {
            for device_id in &registered {
                self.subscriptions
                    .replay(subscription.id, &self.registry.replay_events(device_id));
            }
        }
        Ok(subscription)
    }

    pub fn close_subscription(&self, id: uuid::Uuid, reason: &str) {
        self.subscriptions.close(id, reason);
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
