//! Config schema with strict parsing.
//!
//! `deny_unknown_fields` prevents silent misconfiguration.

use serde::Deserialize;

use presmesh_core::{PresmeshError, Result};

use crate::presence::{EventName, PresenceOptions};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub version: u32,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub presence: PresenceSection,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(PresmeshError::InvalidArgument(
                "unsupported config version".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis
            && self.store.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(PresmeshError::InvalidArgument(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        if self.presence.ttl_ms <= 0 {
            return Err(PresmeshError::InvalidArgument(
                "presence.ttl_ms must be positive".to_string(),
            ));
        }
        if self.presence.reaper_interval_ms == 0 {
            return Err(PresmeshError::InvalidArgument(
                "presence.reaper_interval_ms must be positive".to_string(),
            ));
        }
        if EventName::parse(&self.presence.event_name).is_none() {
            return Err(PresmeshError::InvalidArgument(
                "presence.event_name must be a non-empty svc:type pair".to_string(),
            ));
        }
        Ok(())
    }

    /// The fabric tunables, with the lookback defaulting to twice the TTL.
    pub fn presence_options(&self) -> PresenceOptions {
        PresenceOptions {
            ttl_ms: self.presence.ttl_ms,
            reaper_interval_ms: self.presence.reaper_interval_ms,
            reaper_lookback_ms: self
                .presence
                .reaper_lookback_ms
                .unwrap_or(2 * self.presence.ttl_ms),
            event_name: EventName::parse(&self.presence.event_name).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Backing-store wiring. `memory` keeps a single node self-contained;
/// `redis` is what a multi-node cluster runs.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceSection {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: i64,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    /// Defaults to `2 * ttl_ms` when omitted.
    #[serde(default)]
    pub reaper_lookback_ms: Option<i64>,
    #[serde(default = "default_event_name")]
    pub event_name: String,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            reaper_lookback_ms: None,
            event_name: default_event_name(),
        }
    }
}

fn default_ttl_ms() -> i64 {
    30_000
}

fn default_reaper_interval_ms() -> u64 {
    3_000
}

fn default_event_name() -> String {
    "presence:event".into()
}
