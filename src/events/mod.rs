//! Event Distribution
//!
//! Publish/subscribe plumbing shared by the conductor and its plugins.
//!
//! Event names are free-form. The names below are emitted by the conductor
//! itself; the three `sequence-*` terminal events are reserved for its
//! lifecycle notifications.

pub mod bus;

pub use bus::{BusDebugInfo, EmitReport, EventBus, EventCallback, EventFuture, EventResult, Subscription};

pub const SEQUENCE_STARTED: &str = "sequence-started";
pub const SEQUENCE_QUEUED: &str = "sequence-queued";
pub const SEQUENCE_COMPLETED: &str = "sequence-completed";
pub const SEQUENCE_FAILED: &str = "sequence-failed";
pub const SEQUENCE_CANCELLED: &str = "sequence-cancelled";

pub const BEAT_STARTED: &str = "beat:started";
pub const BEAT_COMPLETED: &str = "beat:completed";
pub const BEAT_ERRORED: &str = "beat:errored";

pub const PLUGIN_MOUNTED: &str = "plugin:mounted";

/// Terminal lifecycle events.
pub const RESERVED_EVENTS: [&str; 3] = [SEQUENCE_COMPLETED, SEQUENCE_FAILED, SEQUENCE_CANCELLED];

/// Whether `event` is one of the conductor's terminal lifecycle events.
pub fn is_reserved(event: &str) -> bool {
    RESERVED_EVENTS.contains(&event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_events() {
        assert!(is_reserved("sequence-completed"));
        assert!(is_reserved(SEQUENCE_CANCELLED));
        assert!(!is_reserved(SEQUENCE_STARTED));
        assert!(!is_reserved(BEAT_COMPLETED));
    }
}
