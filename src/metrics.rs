//! Prometheus counters for the core replication events.

use lazy_static::lazy_static;
use prometheus::{IntCounter, Registry};

lazy_static! {
    /// Global registry gathered by the metrics endpoint.
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    pub static ref ELECTIONS_STARTED: IntCounter =
        IntCounter::new("elections_started", "election rounds begun by this node").unwrap();

    pub static ref HEARTBEATS_SENT: IntCounter =
        IntCounter::new("heartbeats_sent", "heartbeat RPCs issued as leader").unwrap();

    pub static ref ENTRIES_APPENDED: IntCounter =
        IntCounter::new("entries_appended", "entries written to the local segment").unwrap();

    pub static ref ENTRIES_APPLIED: IntCounter =
        IntCounter::new("entries_applied", "committed entries handed to the state machine")
            .unwrap();
}

/// Registers all collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(ELECTIONS_STARTED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(HEARTBEATS_SENT.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ENTRIES_APPENDED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ENTRIES_APPLIED.clone()));
}
