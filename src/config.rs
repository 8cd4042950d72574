//! Configuration for the projection and subscription layers

use std::time::Duration;

/// Configuration consumed by [`crate::projection::ProjectionRegistry`] and
/// [`crate::subscription::SubscriptionRegistry`].
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// How long an idle device registration (refcount zero) survives before
    /// its models and bus subscription are evicted.
    pub cache_expiration: Duration,
    /// Number of workers folding bus deliveries. Folds for distinct
    /// aggregates run in parallel up to this bound.
    pub pool_size: usize,
    /// Capacity of each subscription's delivery channel.
    pub subscription_buffer: usize,
    /// How long a delivery may block on a full subscription channel before
    /// the subscription is torn down as a slow consumer.
    pub send_timeout: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            cache_expiration: Duration::from_secs(60),
            pool_size: 16,
            subscription_buffer: 32,
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl ProjectionConfig {
    /// Period of the eviction sweep: half the expiration, clamped to
    /// `[1s, 60s]`.
    pub fn sweep_period(&self) -> Duration {
        let half = self.cache_expiration / 2;
        half.clamp(Duration::from_secs(1), Duration::from_secs(60))
    }
}
