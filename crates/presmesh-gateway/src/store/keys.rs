//! Key layout of the presence fabric.
//!
//! All persisted state lives under the `prs:` prefix. The `{room:<id>}` brace
//! expression is a hash tag: every key of one room hashes to the same
//! partition, so the multi-key atomic units stay valid if the keyspace is
//! ever sharded.

/// Hash field names of the per-connection record.
pub const F_USER_ID: &str = "user_id";
pub const F_ROOM_ID: &str = "room_id";
pub const F_STATE: &str = "state";
pub const F_EPOCH: &str = "epoch";
pub const F_LAST_SEEN_MS: &str = "last_seen_ms";

/// Per-connection record (hash, expires after `ttl_ms`).
pub fn conn(conn_id: &str) -> String {
    format!("prs:conn:{conn_id}")
}

/// Room connections (set of connId).
pub fn room_conns(room_id: &str) -> String {
    format!("prs:{{room:{room_id}}}:conns")
}

/// Room unique users (set of userId).
pub fn room_members(room_id: &str) -> String {
    format!("prs:{{room:{room_id}}}:members")
}

/// Room last-seen index (sorted set, score = lastSeenMs).
pub fn room_last_seen(room_id: &str) -> String {
    format!("prs:{{room:{room_id}}}:last_seen")
}

/// Room connection metadata sidecar (hash, field = connId, value = JSON).
///
/// Outlives the conn hash's TTL so a reaped departure can still name its
/// user and epoch.
pub fn room_conn_meta(room_id: &str) -> String {
    format!("prs:{{room:{room_id}}}:conn_meta")
}

/// A user's connections across rooms (set of connId).
pub fn user_conns(user_id: &str) -> String {
    format!("prs:user:{user_id}:conns")
}

/// Set of rooms with at least one connection (reaper discovery).
pub fn active_rooms() -> String {
    "prs:active_rooms".to_string()
}

/// Pub/sub channel carrying a room's presence events.
pub fn room_events(room_id: &str) -> String {
    format!("prs:{{room:{room_id}}}:events")
}

/// Subscription pattern matching every room's event channel.
pub fn room_events_pattern() -> String {
    "prs:{room:*}:events".to_string()
}
