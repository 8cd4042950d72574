//! Event store contract
//!
//! The durable, append-only event store is an external collaborator; the
//! projection only needs ordered replay per aggregate. [`InMemoryEventStore`]
//! implements the contract for tests and for the bundled single-process
//! deployment.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::debug;

use crate::errors::{ProjectionError, ProjectionResult};
use crate::events::{EventEnvelope, ResourceId};

/// Query addressing either one aggregate or every aggregate of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    pub device_id: String,
    /// `None` selects every aggregate of the device.
    pub href: Option<String>,
}

impl AggregateQuery {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            href: None,
        }
    }

    pub fn aggregate(resource_id: &ResourceId) -> Self {
        Self {
            device_id: resource_id.device_id.clone(),
            href: Some(resource_id.href.clone()),
        }
    }
}

/// Ordered replay of committed events per aggregate.
///
/// Implementations must return each aggregate's events in version order;
/// ordering across aggregates is unspecified. Replay may begin at the latest
/// snapshot rather than version zero — the fold layer is version-gated and
/// tolerates both.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Load events matching the queries.
    async fn load(&self, queries: &[AggregateQuery]) -> ProjectionResult<Vec<EventEnvelope>>;
}

/// In-memory store keyed `device -> href -> events`.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<String, HashMap<String, Vec<EventEnvelope>>>>,
    load_calls: AtomicUsize,
    fail_loads: std::sync::atomic::AtomicBool,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one committed event; the caller assigns versions in commit
    /// order, same as the writer side of the durable store would.
    pub fn append(&self, event: EventEnvelope) {
        let mut events = self.events.write().expect("store lock poisoned");
        events
            .entry(event.resource_id.device_id.clone())
            .or_default()
            .entry(event.resource_id.href.clone())
            .or_default()
            .push(event);
    }

    /// Number of `load` calls served, used by reload-bound tests.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Make subsequent loads fail, simulating a store outage.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn load(&self, queries: &[AggregateQuery]) -> ProjectionResult<Vec<EventEnvelope>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(ProjectionError::Store("simulated outage".to_string()));
        }
        let events = self.events.read().expect("store lock poisoned");
        let mut out = Vec::new();
        for query in queries {
            let Some(device) = events.get(&query.device_id) else {
                continue;
            };
            match &query.href {
                Some(href) => {
                    if let Some(stream) = device.get(href) {
                        out.extend(stream.iter().cloned());
                    }
                }
                None => {
                    for stream in device.values() {
                        out.extend(stream.iter().cloned());
                    }
                }
            }
        }
        debug!(queries = queries.len(), events = out.len(), "store load");
        Ok(out)
    }
}
