//! Resource projection and subscription engine for a device hub
//!
//! This crate materializes per-device aggregate state from an event store,
//! keeps it live through a publish/subscribe event bus, fans applied
//! transitions out to filtered subscriptions and answers resource-shadow
//! and device-directory queries from the in-memory views.

pub mod bus;
pub mod config;
pub mod errors;
pub mod events;
pub mod model;
pub mod projection;
pub mod query;
pub mod service;
pub mod store;
pub mod subscription;
pub mod topics;

// Re-export commonly used types
pub use bus::{BusHandler, BusSubscription, EventBus, InMemoryEventBus, NatsBusConfig, NatsEventBus};
pub use config::ProjectionConfig;
pub use errors::{ProjectionError, ProjectionResult};
pub use events::{
    ConnectionStatus, Content, EventEnvelope, EventKind, EventPayload, PendingCommand,
    PendingCommandKind, ResourceId, ResourceLink, TwinSyncStatus,
};
pub use model::{Model, PendingCommandEntry};
pub use projection::{ProjectionObserver, ProjectionRegistry, RegistryHandle};
pub use query::{DeviceLinks, DeviceMetadataView, ResourceDirectory, ResourceState};
pub use service::ProjectionService;
pub use store::{AggregateQuery, EventStore, InMemoryEventStore};
pub use subscription::{
    FilterBitmask, Subscription, SubscriptionEvent, SubscriptionRegistry, SubscriptionScope,
};
