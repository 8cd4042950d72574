//! Event bus contract and transports
//!
//! Committed events reach every running projection instance through a
//! publish/subscribe bus, one topic per device (see [`crate::topics`]).
//! [`NatsEventBus`] is the production transport; [`InMemoryEventBus`] serves
//! tests and the single-process deployment.

use async_nats::ConnectOptions;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::errors::{ProjectionError, ProjectionResult};
use crate::events::EventEnvelope;

/// Receives batches of committed events for one subscribed topic.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, events: Vec<EventEnvelope>);
}

/// Publish/subscribe transport for committed events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Subscribe `handler` to `topic`. The returned handle unsubscribes on
    /// [`BusSubscription::close`] or drop.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BusHandler>,
    ) -> ProjectionResult<BusSubscription>;

    /// Publish a batch of events on `topic`.
    async fn publish(&self, topic: &str, events: &[EventEnvelope]) -> ProjectionResult<()>;
}

/// Live bus subscription; dropping it stops delivery.
pub struct BusSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl BusSubscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn close(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

type HandlerMap = Mutex<HashMap<String, Vec<(u64, Arc<dyn BusHandler>)>>>;

/// In-process bus delivering inline on `publish`.
#[derive(Default)]
pub struct InMemoryEventBus {
    handlers: Arc<HandlerMap>,
    next_id: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`, used by eviction tests.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BusHandler>,
    ) -> ProjectionResult<BusSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .expect("bus lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        debug!(topic, id, "bus subscribe");

        let handlers = Arc::clone(&self.handlers);
        let topic = topic.to_string();
        Ok(BusSubscription::new(move || {
            let mut handlers = handlers.lock().expect("bus lock poisoned");
            if let Some(subs) = handlers.get_mut(&topic) {
                subs.retain(|(sub_id, _)| *sub_id != id);
                if subs.is_empty() {
                    handlers.remove(&topic);
                }
            }
        }))
    }

    async fn publish(&self, topic: &str, events: &[EventEnvelope]) -> ProjectionResult<()> {
        let handlers: Vec<Arc<dyn BusHandler>> = self
            .handlers
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler.handle(events.to_vec()).await;
        }
        Ok(())
    }
}

/// Configuration for the NATS-backed bus.
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    /// NATS server URLs
    pub servers: Vec<String>,
    /// Client name
    pub name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "hub-projection".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// NATS-backed event bus; one NATS subject per device topic.
#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
}

impl NatsEventBus {
    pub async fn connect(config: NatsBusConfig) -> ProjectionResult<Self> {
        let options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout);
        let client = async_nats::connect_with_options(config.servers.join(","), options)
            .await
            .map_err(|e| ProjectionError::Bus(e.to_string()))?;
        info!(servers = ?config.servers, "connected to NATS");
        Ok(Self { client })
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn BusHandler>,
    ) -> ProjectionResult<BusSubscription> {
        let mut subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| ProjectionError::Bus(e.to_string()))?;
        info!(topic, "subscribed to NATS subject");

        let subject = topic.to_string();
        let task: JoinHandle<()> = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                match serde_json::from_slice::<Vec<EventEnvelope>>(&msg.payload) {
                    Ok(events) => handler.handle(events).await,
                    Err(e) => {
                        error!(subject = %subject, error = %e, "failed to decode event batch");
                    }
                }
            }
        });
        Ok(BusSubscription::new(move || task.abort()))
    }

    async fn publish(&self, topic: &str, events: &[EventEnvelope]) -> ProjectionResult<()> {
        let payload = serde_json::to_vec(events)?;
        self.client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| ProjectionError::Bus(e.to_string()))?;
        debug!(topic, count = events.len(), "published event batch");
        Ok(())
    }
}
