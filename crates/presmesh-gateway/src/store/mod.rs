//! Backing-store seam.
//!
//! The fabric needs a shared key-value service with hashes, sets, sorted
//! sets, pub/sub, and multi-key updates that commit atomically. `RedisStore`
//! is the production implementation; `MemoryStore` carries single-node
//! deployments and the test suite with identical semantics.
//!
//! The three atomic units (`apply_join`, `apply_heartbeat`, `apply_leave`)
//! live behind this seam because "all effects or none" can only be
//! guaranteed inside the store's own concurrency model (a Lua script, or one
//! critical section). The presence service stays the sole caller of the
//! mutating units.

pub mod keys;
pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use presmesh_core::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Inputs of the atomic join unit.
#[derive(Debug, Clone)]
pub struct JoinWrite {
    pub room_id: String,
    pub user_id: String,
    pub conn_id: String,
    /// Serialized state object written to the conn hash.
    pub state_json: String,
    pub now_ms: i64,
    pub ttl_ms: i64,
    /// Epoch floor carried over a cross-room rejoin: the internal leave of
    /// the prior room deletes the record, so the allocated epoch must still
    /// strictly exceed this value.
    pub prior_epoch: Option<i64>,
}

/// Result of the atomic join unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// All keys written; `epoch` is the newly allocated epoch.
    Committed { epoch: i64 },
    /// The conn record is bound to another room. Nothing was written; the
    /// caller must leave that room first and retry.
    Rebound { current_room: String },
}

/// Inputs of the atomic heartbeat unit.
#[derive(Debug, Clone)]
pub struct HeartbeatWrite {
    pub conn_id: String,
    pub room_id: String,
    /// Epoch supplied by the client (or resolved by the service); the unit
    /// fences against the stored epoch itself.
    pub expected_epoch: i64,
    pub now_ms: i64,
    pub ttl_ms: i64,
    /// Merged state to overwrite, or `None` when unchanged.
    pub state_json: Option<String>,
}

/// Result of the atomic heartbeat unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Liveness (and state, when supplied) written; `epoch` is authoritative.
    Applied { epoch: i64 },
    /// Fenced: the supplied epoch is older than the stored one. No writes.
    Stale { epoch: i64 },
    /// No conn record.
    Missing,
}

/// Inputs of the atomic leave unit.
#[derive(Debug, Clone)]
pub struct LeaveWrite {
    pub conn_id: String,
    pub room_id: String,
    /// User resolved by the caller; the unit prefers the stored record and
    /// falls back to this when only stray index entries remain.
    pub user_id: String,
    /// Reaper guard: only remove if the stored last-seen is strictly below
    /// this cutoff. `None` removes unconditionally.
    pub stale_before: Option<i64>,
}

/// Result of the atomic leave unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Record and aggregates removed; carries the authoritative identity for
    /// the departure event.
    Removed { user_id: String, epoch: i64 },
    /// Staleness guard failed: the connection heartbeated after the scan.
    Fresh,
    /// The conn now lives in another room; this room's stray index entries
    /// were scrubbed but the record was untouched.
    Moved { current_room: String },
    /// Neither record nor sidecar metadata exist; stray index entries were
    /// scrubbed.
    Missing,
}

/// One pub/sub message.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Live pattern subscription. Dropping it stops the feed.
pub struct Subscription {
    rx: mpsc::Receiver<StoreMessage>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<StoreMessage>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next message, or `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<StoreMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Typed operations on the backing store.
///
/// Every method maps connectivity loss to `ErrorKind::StoreUnavailable`.
#[async_trait]
pub trait Store: Send + Sync {
    /// All fields of a hash; empty map when the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Batched `hash_get_all` over many keys (single round trip).
    async fn hash_get_all_multi(&self, hash_keys: &[String]) -> Result<Vec<HashMap<String, String>>>;

    /// One field of a hash.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Members of a set; empty when absent.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Sorted-set members with score strictly below `cutoff`.
    async fn sorted_range_below(&self, key: &str, cutoff: i64) -> Result<Vec<String>>;

    /// Fire an event on a channel. Best-effort: no delivery guarantee.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel pattern on a dedicated subscribe-mode
    /// connection. Delivery resumes automatically after a backend reconnect;
    /// missed messages are not back-filled.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    async fn apply_join(&self, w: &JoinWrite) -> Result<JoinOutcome>;
    async fn apply_heartbeat(&self, w: &HeartbeatWrite) -> Result<HeartbeatOutcome>;
    async fn apply_leave(&self, w: &LeaveWrite) -> Result<LeaveOutcome>;
}

/// Redis-style glob matching restricted to `*`, the only class the fabric's
/// channel patterns use.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == channel,
        Some((prefix, rest)) => {
            let Some(after) = channel.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            after
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(after.len()))
                .any(|i| channel_matches(rest, &after[i..]))
        }
    }
}
