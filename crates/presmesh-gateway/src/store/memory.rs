//! In-memory store: single-node deployments and the test suite.
//!
//! One mutex over all tables makes each atomic unit a critical section,
//! which is the same all-or-nothing contract the Lua scripts give on Redis.
//! Conn hashes carry a millisecond expiry checked lazily on access; pub/sub
//! is a broadcast channel filtered per subscription by channel pattern.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use presmesh_core::time::now_ms;
use presmesh_core::Result;
use tokio::sync::{broadcast, mpsc, Mutex};

use super::{
    channel_matches, keys, HeartbeatOutcome, HeartbeatWrite, JoinOutcome, JoinWrite, LeaveOutcome,
    LeaveWrite, Store, StoreMessage, Subscription,
};

#[derive(Default)]
struct Tables {
    hashes: HashMap<String, HashMap<String, String>>,
    /// Key -> wall-clock ms deadline. Only conn hashes ever get one.
    expiries: HashMap<String, i64>,
    sets: HashMap<String, HashSet<String>>,
    /// Sorted sets as member -> score; range queries scan.
    zsets: HashMap<String, HashMap<String, i64>>,
}

impl Tables {
    fn purge_expired(&mut self, now: i64) {
        let dead: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for k in dead {
            self.expiries.remove(&k);
            self.hashes.remove(&k);
        }
    }

    fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|h| h.get(field)).cloned()
    }

    fn set_remove(&mut self, key: &str, member: &str) {
        if let Some(s) = self.sets.get_mut(key) {
            s.remove(member);
            if s.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn zset_remove(&mut self, key: &str, member: &str) {
        if let Some(z) = self.zsets.get_mut(key) {
            z.remove(member);
            if z.is_empty() {
                self.zsets.remove(key);
            }
        }
    }

    /// Drop a room's aggregate keys once its conn set is empty.
    fn collapse_room_if_empty(&mut self, room_id: &str) {
        let empty = self
            .sets
            .get(&keys::room_conns(room_id))
            .map_or(true, HashSet::is_empty);
        if empty {
            self.set_remove(&keys::active_rooms(), room_id);
            self.hashes.remove(&keys::room_conn_meta(room_id));
            self.sets.remove(&keys::room_members(room_id));
            self.zsets.remove(&keys::room_last_seen(room_id));
        }
    }

    /// Any *other* connection of `user_id` still present in the room's
    /// metadata sidecar?
    fn user_still_in_room(&self, room_id: &str, user_id: &str) -> bool {
        self.hashes
            .get(&keys::room_conn_meta(room_id))
            .map_or(false, |meta| {
                meta.values().any(|v| {
                    serde_json::from_str::<serde_json::Value>(v)
                        .ok()
                        .and_then(|m| m.get("user_id").and_then(|u| u.as_str().map(String::from)))
                        .is_some_and(|u| u == user_id)
                })
            })
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    events: broadcast::Sender<StoreMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            tables: Mutex::new(Tables::default()),
            events,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut t = self.tables.lock().await;
        t.purge_expired(now_ms());
        Ok(t.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_get_all_multi(&self, hash_keys: &[String]) -> Result<Vec<HashMap<String, String>>> {
        let mut t = self.tables.lock().await;
        t.purge_expired(now_ms());
        Ok(hash_keys
            .iter()
            .map(|k| t.hashes.get(k).cloned().unwrap_or_default())
            .collect())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut t = self.tables.lock().await;
        t.purge_expired(now_ms());
        Ok(t.hash_field(key, field))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let t = self.tables.lock().await;
        Ok(t.sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_range_below(&self, key: &str, cutoff: i64) -> Result<Vec<String>> {
        let t = self.tables.lock().await;
        Ok(t.zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, score)| **score < cutoff)
                    .map(|(m, _)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.events.send(StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let mut feed = self.events.subscribe();
        let pattern = pattern.to_string();
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(msg) => {
                        if channel_matches(&pattern, &msg.channel) && tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    // Lagged subscribers skip ahead; converging via snapshots
                    // is the contract.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }

    async fn apply_join(&self, w: &JoinWrite) -> Result<JoinOutcome> {
        let mut t = self.tables.lock().await;
        t.purge_expired(w.now_ms);

        let conn_key = keys::conn(&w.conn_id);
        if let Some(current) = t.hash_field(&conn_key, keys::F_ROOM_ID) {
            if current != w.room_id {
                return Ok(JoinOutcome::Rebound { current_room: current });
            }
        }

        let mut epoch = w.now_ms;
        if let Some(prev) = t
            .hash_field(&conn_key, keys::F_EPOCH)
            .and_then(|e| e.parse::<i64>().ok())
        {
            epoch = epoch.max(prev + 1);
        }
        if let Some(prior) = w.prior_epoch {
            epoch = epoch.max(prior + 1);
        }

        let hash = t.hashes.entry(conn_key.clone()).or_default();
        hash.insert(keys::F_USER_ID.into(), w.user_id.clone());
        hash.insert(keys::F_ROOM_ID.into(), w.room_id.clone());
        hash.insert(keys::F_STATE.into(), w.state_json.clone());
        hash.insert(keys::F_EPOCH.into(), epoch.to_string());
        hash.insert(keys::F_LAST_SEEN_MS.into(), w.now_ms.to_string());
        t.expiries.insert(conn_key, w.now_ms + w.ttl_ms);

        t.sets
            .entry(keys::room_conns(&w.room_id))
            .or_default()
            .insert(w.conn_id.clone());
        t.sets
            .entry(keys::room_members(&w.room_id))
            .or_default()
            .insert(w.user_id.clone());
        t.zsets
            .entry(keys::room_last_seen(&w.room_id))
            .or_default()
            .insert(w.conn_id.clone(), w.now_ms);
        t.hashes
            .entry(keys::room_conn_meta(&w.room_id))
            .or_default()
            .insert(
                w.conn_id.clone(),
                serde_json::json!({ "user_id": w.user_id, "epoch": epoch }).to_string(),
            );
        t.sets
            .entry(keys::user_conns(&w.user_id))
            .or_default()
            .insert(w.conn_id.clone());
        t.sets
            .entry(keys::active_rooms())
            .or_default()
            .insert(w.room_id.clone());

        Ok(JoinOutcome::Committed { epoch })
    }

    async fn apply_heartbeat(&self, w: &HeartbeatWrite) -> Result<HeartbeatOutcome> {
        let mut t = self.tables.lock().await;
        t.purge_expired(w.now_ms);

        let conn_key = keys::conn(&w.conn_id);
        let Some(epoch) = t
            .hash_field(&conn_key, keys::F_EPOCH)
            .and_then(|e| e.parse::<i64>().ok())
        else {
            return Ok(HeartbeatOutcome::Missing);
        };
        if w.expected_epoch < epoch {
            return Ok(HeartbeatOutcome::Stale { epoch });
        }

        let hash = t.hashes.entry(conn_key.clone()).or_default();
        hash.insert(keys::F_LAST_SEEN_MS.into(), w.now_ms.to_string());
        if let Some(state) = &w.state_json {
            hash.insert(keys::F_STATE.into(), state.clone());
        }
        t.expiries.insert(conn_key, w.now_ms + w.ttl_ms);
        t.zsets
            .entry(keys::room_last_seen(&w.room_id))
            .or_default()
            .insert(w.conn_id.clone(), w.now_ms);

        Ok(HeartbeatOutcome::Applied { epoch })
    }

    async fn apply_leave(&self, w: &LeaveWrite) -> Result<LeaveOutcome> {
        let mut t = self.tables.lock().await;
        let now = now_ms();
        t.purge_expired(now);

        let conn_key = keys::conn(&w.conn_id);
        let conn_room = t.hash_field(&conn_key, keys::F_ROOM_ID);

        if let Some(current) = conn_room.clone() {
            if current != w.room_id {
                t.set_remove(&keys::room_conns(&w.room_id), &w.conn_id);
                t.zset_remove(&keys::room_last_seen(&w.room_id), &w.conn_id);
                if let Some(meta) = t.hashes.get_mut(&keys::room_conn_meta(&w.room_id)) {
                    meta.remove(&w.conn_id);
                }
                return Ok(LeaveOutcome::Moved { current_room: current });
            }
        }

        let meta_json = t.hash_field(&keys::room_conn_meta(&w.room_id), &w.conn_id);
        if conn_room.is_none() && meta_json.is_none() {
            t.set_remove(&keys::room_conns(&w.room_id), &w.conn_id);
            t.zset_remove(&keys::room_last_seen(&w.room_id), &w.conn_id);
            t.collapse_room_if_empty(&w.room_id);
            return Ok(LeaveOutcome::Missing);
        }

        if let Some(cutoff) = w.stale_before {
            let seen = t
                .hash_field(&conn_key, keys::F_LAST_SEEN_MS)
                .and_then(|s| s.parse::<i64>().ok())
                .or_else(|| {
                    t.zsets
                        .get(&keys::room_last_seen(&w.room_id))
                        .and_then(|z| z.get(&w.conn_id).copied())
                });
            if seen.is_some_and(|s| s >= cutoff) {
                return Ok(LeaveOutcome::Fresh);
            }
        }

        let meta: Option<serde_json::Value> =
            meta_json.as_deref().and_then(|m| serde_json::from_str(m).ok());
        let user_id = t
            .hash_field(&conn_key, keys::F_USER_ID)
            .or_else(|| {
                meta.as_ref()
                    .and_then(|m| m.get("user_id").and_then(|u| u.as_str().map(String::from)))
            })
            .unwrap_or_else(|| w.user_id.clone());
        let epoch = t
            .hash_field(&conn_key, keys::F_EPOCH)
            .and_then(|e| e.parse::<i64>().ok())
            .or_else(|| meta.as_ref().and_then(|m| m.get("epoch").and_then(|e| e.as_i64())))
            .unwrap_or(0);

        t.hashes.remove(&conn_key);
        t.expiries.remove(&conn_key);
        t.set_remove(&keys::room_conns(&w.room_id), &w.conn_id);
        t.zset_remove(&keys::room_last_seen(&w.room_id), &w.conn_id);
        if let Some(meta) = t.hashes.get_mut(&keys::room_conn_meta(&w.room_id)) {
            meta.remove(&w.conn_id);
        }
        if !user_id.is_empty() {
            t.set_remove(&keys::user_conns(&w.user_id), &w.conn_id);
            if !t.user_still_in_room(&w.room_id, &user_id) {
                t.set_remove(&keys::room_members(&w.room_id), &user_id);
            }
        }
        t.collapse_room_if_empty(&w.room_id);

        Ok(LeaveOutcome::Removed { user_id, epoch })
    }
}
