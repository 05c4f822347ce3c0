//! Presence wire payloads: requests, ack bodies, and the broadcast event.
//!
//! Everything here crosses a trust boundary, so field names are part of the
//! protocol (camelCase) and requests are parsed strictly. The same event
//! struct is the pub/sub payload between nodes and the `data` of the
//! broadcast envelope delivered to clients.

use serde::{Deserialize, Serialize};

use crate::state::StateMap;

/// Maximum byte length of `roomId` / `userId`.
pub const MAX_ID_BYTES: usize = 256;
/// Maximum serialized size of a connection's `state` object.
pub const MAX_STATE_BYTES: usize = 64 * 1024;
/// Epochs must fit in 53 bits so every client numeric type can hold them.
pub const MAX_EPOCH: i64 = 1 << 53;

/// `presence:join` request payload.
///
/// Unknown payload fields — a client-supplied `connId` in particular — are
/// ignored; the socket's stable id is the source of truth.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub state: Option<StateMap>,
}

/// `presence:heartbeat` request payload. Unknown fields are ignored, as for
/// [`JoinRequest`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub patch_state: Option<StateMap>,
    #[serde(default)]
    pub epoch: Option<i64>,
}

/// One room member in the snapshot returned on join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub conn_id: String,
    pub user_id: String,
    pub state: StateMap,
    pub last_seen_ms: i64,
    pub epoch: i64,
}

/// The joiner's own identity, echoed in the join ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfInfo {
    pub conn_id: String,
    pub epoch: i64,
}

/// Lifecycle transition carried by a presence event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Join,
    Update,
    Leave,
}

/// Presence event broadcast to every node subscribed to the room.
///
/// `state` is present for join and update, absent for leave; `epoch` is the
/// epoch in force after the transition; `ts` is server wall-clock ms at
/// publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub room_id: String,
    pub user_id: String,
    pub conn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMap>,
    pub epoch: i64,
    pub ts: i64,
}
