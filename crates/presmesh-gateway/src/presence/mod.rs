//! The presence fabric: authoritative service, cross-node event bridge,
//! stale-connection reaper, and the runtime that owns their lifecycle.

pub mod bridge;
pub mod reaper;
pub mod runtime;
pub mod service;

pub use bridge::{EventBridge, HandlerSet, PresenceHandler};
pub use reaper::Reaper;
pub use runtime::PresenceRuntime;
pub use service::{Departure, HeartbeatAccepted, JoinAccepted, PresenceService};

/// Broadcast event name, split into the envelope's `svc`/`type` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventName {
    pub svc: String,
    pub kind: String,
}

impl EventName {
    /// Parse a `svc:type` name; both halves must be non-empty.
    pub fn parse(name: &str) -> Option<Self> {
        let (svc, kind) = name.split_once(':')?;
        if svc.is_empty() || kind.is_empty() {
            return None;
        }
        Some(Self {
            svc: svc.to_string(),
            kind: kind.to_string(),
        })
    }
}

impl Default for EventName {
    fn default() -> Self {
        Self {
            svc: "presence".to_string(),
            kind: "event".to_string(),
        }
    }
}

/// The fabric's tunables. Everything else is wiring.
#[derive(Debug, Clone)]
pub struct PresenceOptions {
    /// Expiry applied to conn records; also the maximum heartbeat interval
    /// before a connection may be reaped.
    pub ttl_ms: i64,
    /// Frequency of reaper scans.
    pub reaper_interval_ms: u64,
    /// Age threshold for a connection to be considered stale.
    pub reaper_lookback_ms: i64,
    /// Name used for server-emitted presence broadcasts.
    pub event_name: EventName,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        let ttl_ms = 30_000;
        Self {
            ttl_ms,
            reaper_interval_ms: 3_000,
            reaper_lookback_ms: 2 * ttl_ms,
            event_name: EventName::default(),
        }
    }
}
