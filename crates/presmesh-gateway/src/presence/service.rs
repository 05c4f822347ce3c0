//! Authoritative presence business logic.
//!
//! Owns every write to connection and room aggregate keys. Each public
//! operation maps to one atomic store unit plus an event publication; the
//! store commits all effects or none, and events ride after the commit
//! (publication failure is logged, never surfaced — subscribers converge
//! via snapshots).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use presmesh_core::protocol::presence::{EventKind, PresenceEvent, SnapshotEntry};
use presmesh_core::state::{merge_patch, state_changed, StateMap};
use presmesh_core::time::now_ms;
use presmesh_core::{PresmeshError, Result};
use tokio::time::Instant;

use crate::obs::PresenceMetrics;
use crate::store::{
    keys, HeartbeatOutcome, HeartbeatWrite, JoinOutcome, JoinWrite, LeaveOutcome, LeaveWrite, Store,
};

use super::PresenceOptions;

/// Bound on leave/rejoin chases; a connection rebinding rooms faster than
/// this is a client gone haywire.
const MAX_REBOUND_ATTEMPTS: usize = 8;

/// Result of a join: the fenced epoch plus the room snapshot (including the
/// joiner).
#[derive(Debug)]
pub struct JoinAccepted {
    pub epoch: i64,
    pub snapshot: Vec<SnapshotEntry>,
}

/// Result of a heartbeat. `epoch` is always the authoritative stored epoch;
/// heartbeats never advance it.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatAccepted {
    pub changed: bool,
    pub epoch: i64,
}

/// A completed departure. `epoch` is the epoch that was in force when the
/// connection was removed.
#[derive(Debug, Clone)]
pub struct Departure {
    pub room_id: String,
    pub user_id: String,
    pub epoch: i64,
}

/// Stored conn record, parsed from its hash.
struct ConnRecord {
    user_id: String,
    room_id: String,
    state: StateMap,
    epoch: i64,
    last_seen_ms: i64,
}

impl ConnRecord {
    fn from_hash(hash: &HashMap<String, String>) -> Option<Self> {
        let user_id = hash.get(keys::F_USER_ID)?.clone();
        let room_id = hash.get(keys::F_ROOM_ID)?.clone();
        let epoch = hash.get(keys::F_EPOCH)?.parse::<i64>().ok()?;
        let state = hash
            .get(keys::F_STATE)
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        let last_seen_ms = hash
            .get(keys::F_LAST_SEEN_MS)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        Some(Self {
            user_id,
            room_id,
            state,
            epoch,
            last_seen_ms,
        })
    }
}

struct OpGuard<'a>(&'a AtomicUsize);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct PresenceService {
    store: Arc<dyn Store>,
    opts: PresenceOptions,
    metrics: Arc<PresenceMetrics>,
    in_flight: AtomicUsize,
}

impl PresenceService {
    pub fn new(store: Arc<dyn Store>, opts: PresenceOptions, metrics: Arc<PresenceMetrics>) -> Self {
        Self {
            store,
            opts,
            metrics,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &PresenceOptions {
        &self.opts
    }

    fn op_guard(&self) -> OpGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        OpGuard(&self.in_flight)
    }

    /// Register `conn_id` as a live member of `room_id`.
    ///
    /// Allocates `epoch = max(stored + 1, now_ms)`: strictly monotonic per
    /// connection even across record expiry, with the wall clock as the
    /// lower bound. If the connection is currently bound to another room it
    /// departs that room first (publishing a leave) — the reconnect path.
    /// Re-joining the same room bumps the epoch and overwrites the state.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        conn_id: &str,
        state: Option<StateMap>,
    ) -> Result<JoinAccepted> {
        let _op = self.op_guard();
        let state = state.unwrap_or_default();
        let state_json = serde_json::to_string(&state)
            .map_err(|e| PresmeshError::Internal(format!("state encode failed: {e}")))?;

        let mut attempts = 0;
        // The internal leave below deletes the prior record, so the epoch it
        // carried becomes the floor for the retried join.
        let mut prior_epoch: Option<i64> = None;
        let epoch = loop {
            let w = JoinWrite {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                conn_id: conn_id.to_string(),
                state_json: state_json.clone(),
                now_ms: now_ms(),
                ttl_ms: self.opts.ttl_ms,
                prior_epoch,
            };
            match self.store.apply_join(&w).await? {
                JoinOutcome::Committed { epoch } => break epoch,
                JoinOutcome::Rebound { current_room } => {
                    attempts += 1;
                    if attempts > MAX_REBOUND_ATTEMPTS {
                        return Err(PresmeshError::Internal(
                            "join could not unbind the prior room".to_string(),
                        ));
                    }
                    tracing::debug!(conn = %conn_id, from = %current_room, to = %room_id, "rejoin: departing prior room");
                    let user = self.resolve_user(conn_id, &current_room).await?;
                    if let Some(departed) = self.depart(conn_id, &current_room, &user, None).await? {
                        prior_epoch = prior_epoch.max(Some(departed.epoch));
                    }
                }
            }
        };

        self.metrics.joins_total.inc();
        self.publish_event(
            EventKind::Join,
            room_id,
            user_id,
            conn_id,
            Some(state),
            epoch,
        )
        .await;

        let snapshot = self.snapshot(room_id).await?;
        Ok(JoinAccepted { epoch, snapshot })
    }

    /// Refresh liveness and optionally patch state.
    ///
    /// A supplied epoch older than the stored one fences the whole call:
    /// no writes, no event, `{changed:false}` with the authoritative epoch.
    /// An omitted epoch means the client is not fencing.
    pub async fn heartbeat(
        &self,
        conn_id: &str,
        patch: Option<&StateMap>,
        epoch: Option<i64>,
    ) -> Result<HeartbeatAccepted> {
        let _op = self.op_guard();
        let hash = self.store.hash_get_all(&keys::conn(conn_id)).await?;
        let Some(rec) = ConnRecord::from_hash(&hash) else {
            return Err(PresmeshError::UnknownConnection(conn_id.to_string()));
        };
        self.metrics.heartbeats_total.inc();

        let expected = epoch.unwrap_or(rec.epoch);
        if expected < rec.epoch {
            return Ok(HeartbeatAccepted {
                changed: false,
                epoch: rec.epoch,
            });
        }

        let merged = match patch {
            Some(p) => merge_patch(&rec.state, p),
            None => rec.state.clone(),
        };
        let changed = state_changed(&rec.state, &merged);
        let state_json = if changed {
            Some(
                serde_json::to_string(&merged)
                    .map_err(|e| PresmeshError::Internal(format!("state encode failed: {e}")))?,
            )
        } else {
            None
        };

        let w = HeartbeatWrite {
            conn_id: conn_id.to_string(),
            room_id: rec.room_id.clone(),
            expected_epoch: expected,
            now_ms: now_ms(),
            ttl_ms: self.opts.ttl_ms,
            state_json,
        };
        match self.store.apply_heartbeat(&w).await? {
            HeartbeatOutcome::Applied { epoch } => {
                if changed {
                    self.publish_event(
                        EventKind::Update,
                        &rec.room_id,
                        &rec.user_id,
                        conn_id,
                        Some(merged),
                        epoch,
                    )
                    .await;
                }
                Ok(HeartbeatAccepted { changed, epoch })
            }
            // Raced with a rejoin between the read and the write; the newer
            // epoch wins.
            HeartbeatOutcome::Stale { epoch } => Ok(HeartbeatAccepted {
                changed: false,
                epoch,
            }),
            HeartbeatOutcome::Missing => {
                Err(PresmeshError::UnknownConnection(conn_id.to_string()))
            }
        }
    }

    /// Remove a connection. Idempotent: a second leave returns `None` and
    /// publishes nothing.
    ///
    /// `room_hint` lets callers that know the room (the transport's socket
    /// binding, the reaper's scan) clean up aggregates even after the conn
    /// record's TTL has lapsed.
    pub async fn leave(&self, conn_id: &str, room_hint: Option<&str>) -> Result<Option<Departure>> {
        let _op = self.op_guard();
        let hash = self.store.hash_get_all(&keys::conn(conn_id)).await?;
        let (room_id, user_id) = match ConnRecord::from_hash(&hash) {
            Some(rec) => (rec.room_id, rec.user_id),
            None => match room_hint {
                Some(hint) => (
                    hint.to_string(),
                    self.meta_user(hint, conn_id).await?.unwrap_or_default(),
                ),
                None => return Ok(None),
            },
        };
        let departure = self.depart(conn_id, &room_id, &user_id, None).await?;
        if departure.is_some() {
            self.metrics.leaves_total.inc();
        }
        Ok(departure)
    }

    /// Reaper entry point: leave `conn_id` only if it is still stale at
    /// commit time. Returns whether a departure happened.
    ///
    /// The staleness re-check runs inside the atomic unit, so a connection
    /// that heartbeats between the scan and the leave survives; two reapers
    /// racing produce at most one leave event.
    pub async fn reap(&self, room_id: &str, conn_id: &str, cutoff: i64) -> Result<bool> {
        let _op = self.op_guard();
        let user_id = self.resolve_user(conn_id, room_id).await?;
        let departure = self.depart(conn_id, room_id, &user_id, Some(cutoff)).await?;
        if departure.is_some() {
            self.metrics.reaped_total.inc();
        }
        Ok(departure.is_some())
    }

    /// Full room snapshot: every live member, including entries for the
    /// caller itself. Connections whose record expired mid-read are skipped.
    pub async fn snapshot(&self, room_id: &str) -> Result<Vec<SnapshotEntry>> {
        let conns = self.store.set_members(&keys::room_conns(room_id)).await?;
        if conns.is_empty() {
            return Ok(Vec::new());
        }
        let hash_keys: Vec<String> = conns.iter().map(|c| keys::conn(c)).collect();
        let maps = self.store.hash_get_all_multi(&hash_keys).await?;
        let mut out = Vec::with_capacity(conns.len());
        for (conn_id, hash) in conns.iter().zip(maps) {
            if let Some(rec) = ConnRecord::from_hash(&hash) {
                out.push(SnapshotEntry {
                    conn_id: conn_id.clone(),
                    user_id: rec.user_id,
                    state: rec.state,
                    last_seen_ms: rec.last_seen_ms,
                    epoch: rec.epoch,
                });
            }
        }
        Ok(out)
    }

    /// Wait for in-flight operations to drain, up to `grace`.
    pub async fn quiesce(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.in_flight.load(Ordering::Relaxed) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = self.in_flight.load(Ordering::Relaxed),
                    "dispose grace elapsed; abandoning in-flight operations"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Drive the atomic leave to completion, chasing room moves, and publish
    /// the leave event on success.
    async fn depart(
        &self,
        conn_id: &str,
        room_id: &str,
        user_hint: &str,
        stale_before: Option<i64>,
    ) -> Result<Option<Departure>> {
        let mut room_id = room_id.to_string();
        let mut user_id = user_hint.to_string();
        for _ in 0..MAX_REBOUND_ATTEMPTS {
            let w = LeaveWrite {
                conn_id: conn_id.to_string(),
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                stale_before,
            };
            match self.store.apply_leave(&w).await? {
                LeaveOutcome::Removed { user_id, epoch } => {
                    self.publish_event(EventKind::Leave, &room_id, &user_id, conn_id, None, epoch)
                        .await;
                    return Ok(Some(Departure {
                        room_id,
                        user_id,
                        epoch,
                    }));
                }
                LeaveOutcome::Fresh | LeaveOutcome::Missing => return Ok(None),
                LeaveOutcome::Moved { current_room } => {
                    // A conditional (reaper) leave stops here: the connection
                    // is alive in another room.
                    if stale_before.is_some() {
                        return Ok(None);
                    }
                    user_id = self.resolve_user(conn_id, &current_room).await?;
                    room_id = current_room;
                }
            }
        }
        Err(PresmeshError::Internal("leave did not converge".to_string()))
    }

    /// The user a connection belongs to: the conn record when live, the
    /// room's metadata sidecar when expired, empty when neither knows.
    async fn resolve_user(&self, conn_id: &str, room_id: &str) -> Result<String> {
        if let Some(user) = self
            .store
            .hash_get(&keys::conn(conn_id), keys::F_USER_ID)
            .await?
        {
            return Ok(user);
        }
        Ok(self.meta_user(room_id, conn_id).await?.unwrap_or_default())
    }

    async fn meta_user(&self, room_id: &str, conn_id: &str) -> Result<Option<String>> {
        let meta = self
            .store
            .hash_get(&keys::room_conn_meta(room_id), conn_id)
            .await?;
        Ok(meta.and_then(|m| {
            serde_json::from_str::<serde_json::Value>(&m)
                .ok()
                .and_then(|v| v.get("user_id").and_then(|u| u.as_str().map(String::from)))
        }))
    }

    async fn publish_event(
        &self,
        kind: EventKind,
        room_id: &str,
        user_id: &str,
        conn_id: &str,
        state: Option<StateMap>,
        epoch: i64,
    ) {
        let event = PresenceEvent {
            kind,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
            state,
            epoch,
            ts: now_ms(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(err = %e, "event encode failed");
                self.metrics.publish_failures_total.inc();
                return;
            }
        };
        if let Err(e) = self.store.publish(&keys::room_events(room_id), &payload).await {
            // State mutation already committed; subscribers converge via
            // snapshot on next join.
            tracing::warn!(err = %e, room = %room_id, "event publish failed");
            self.metrics.publish_failures_total.inc();
        }
    }
}
