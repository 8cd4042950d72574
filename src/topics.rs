//! Event-bus topic naming
//!
//! All committed events of one device are published on a single per-device
//! topic. The projection subscribes one topic per registered device, so the
//! bus never delivers events for devices nobody is interested in.

/// Root namespace for all hub event topics.
pub const EVENTS_ROOT: &str = "events";

/// Topic carrying every committed event of one device.
pub fn device_events(device_id: &str) -> String {
    format!("{}.device.{}", EVENTS_ROOT, device_id)
}

/// Wildcard subject matching every device topic, usable with transports that
/// support subject hierarchies (NATS).
pub fn all_device_events() -> String {
    format!("{}.device.>", EVENTS_ROOT)
}
