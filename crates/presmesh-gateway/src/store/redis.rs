//! Redis-backed store.
//!
//! Commands run over a multiplexed `ConnectionManager`; the three atomic
//! units are Lua scripts so their multi-key effects commit as one unit under
//! Redis' own execution model. Subscriptions use a dedicated pub/sub
//! connection (mixing subscribe mode with commands is not allowed) and
//! re-subscribe automatically after a connection loss; missed events are not
//! back-filled.
//!
//! The scripts assume the room's keys and the conn/user keys are reachable
//! from one script invocation, i.e. the non-cluster deployment the fabric
//! targets. The `{room:…}` hash tags keep each room's family colocated if
//! the keyspace is ever sharded.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use presmesh_core::{PresmeshError, Result};
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::mpsc;

use super::{
    keys, HeartbeatOutcome, HeartbeatWrite, JoinOutcome, JoinWrite, LeaveOutcome, LeaveWrite,
    Store, StoreMessage, Subscription,
};

/// Allocate the epoch, write the conn record, and index it in every room
/// aggregate. Refuses (without writing) when the conn is bound elsewhere.
const JOIN_LUA: &str = r#"
local cur_room = redis.call('HGET', KEYS[1], 'room_id')
if cur_room and cur_room ~= ARGV[1] then
  return {'rebound', cur_room}
end
local epoch = tonumber(ARGV[5])
local prev = tonumber(redis.call('HGET', KEYS[1], 'epoch'))
if prev and prev + 1 > epoch then
  epoch = prev + 1
end
local prior = tonumber(ARGV[7])
if prior and prior + 1 > epoch then
  epoch = prior + 1
end
local epoch_s = string.format('%.0f', epoch)
redis.call('HSET', KEYS[1],
  'user_id', ARGV[2],
  'room_id', ARGV[1],
  'state', ARGV[4],
  'epoch', epoch_s,
  'last_seen_ms', ARGV[5])
redis.call('PEXPIRE', KEYS[1], ARGV[6])
redis.call('SADD', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[2])
redis.call('ZADD', KEYS[4], ARGV[5], ARGV[3])
redis.call('HSET', KEYS[5], ARGV[3], cjson.encode({user_id = ARGV[2], epoch = epoch}))
redis.call('SADD', KEYS[6], ARGV[3])
redis.call('SADD', KEYS[7], ARGV[1])
return {'ok', epoch_s}
"#;

/// Refresh liveness (and optionally state) iff the supplied epoch is not
/// older than the stored one.
const HEARTBEAT_LUA: &str = r#"
local epoch = redis.call('HGET', KEYS[1], 'epoch')
if not epoch then
  return {'missing'}
end
if tonumber(ARGV[2]) < tonumber(epoch) then
  return {'stale', epoch}
end
redis.call('HSET', KEYS[1], 'last_seen_ms', ARGV[3])
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[1], 'state', ARGV[5])
end
redis.call('PEXPIRE', KEYS[1], ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return {'ok', epoch}
"#;

/// Remove a connection from a room, keeping every aggregate consistent.
/// Handles the record having expired (sidecar metadata supplies the
/// departure's identity), the conn having moved rooms (scrub strays only),
/// and an optional staleness guard for the reaper.
const LEAVE_LUA: &str = r#"
local conn_room = redis.call('HGET', KEYS[1], 'room_id')
if conn_room and conn_room ~= ARGV[2] then
  redis.call('SREM', KEYS[2], ARGV[1])
  redis.call('ZREM', KEYS[4], ARGV[1])
  redis.call('HDEL', KEYS[5], ARGV[1])
  return {'moved', conn_room}
end
local meta = redis.call('HGET', KEYS[5], ARGV[1])
if not conn_room and not meta then
  redis.call('SREM', KEYS[2], ARGV[1])
  redis.call('ZREM', KEYS[4], ARGV[1])
  if redis.call('SCARD', KEYS[2]) == 0 then
    redis.call('SREM', KEYS[7], ARGV[2])
    redis.call('DEL', KEYS[3], KEYS[4], KEYS[5])
  end
  return {'missing'}
end
if ARGV[4] ~= '' then
  local cutoff = tonumber(ARGV[4])
  local seen = tonumber(redis.call('HGET', KEYS[1], 'last_seen_ms'))
  if not seen then
    seen = tonumber(redis.call('ZSCORE', KEYS[4], ARGV[1]))
  end
  if seen and seen >= cutoff then
    return {'fresh'}
  end
end
local user = redis.call('HGET', KEYS[1], 'user_id')
local epoch = redis.call('HGET', KEYS[1], 'epoch')
if meta then
  local m = cjson.decode(meta)
  if not user then user = m['user_id'] end
  if not epoch then epoch = string.format('%.0f', m['epoch']) end
end
if not user then user = ARGV[3] end
if not epoch then epoch = '0' end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
if user ~= '' then
  redis.call('SREM', KEYS[6], ARGV[1])
  local still = false
  for _, v in ipairs(redis.call('HVALS', KEYS[5])) do
    if cjson.decode(v)['user_id'] == user then
      still = true
      break
    end
  end
  if not still then
    redis.call('SREM', KEYS[3], user)
  end
end
if redis.call('SCARD', KEYS[2]) == 0 then
  redis.call('SREM', KEYS[7], ARGV[2])
  redis.call('DEL', KEYS[3], KEYS[4], KEYS[5])
end
return {'removed', user, epoch}
"#;

fn unavailable(e: redis::RedisError) -> PresmeshError {
    PresmeshError::StoreUnavailable(e.to_string())
}

fn malformed(what: &str) -> PresmeshError {
    PresmeshError::Internal(format!("store returned malformed {what} reply"))
}

pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    join_script: Script,
    heartbeat_script: Script,
    leave_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let manager = client.get_connection_manager().await.map_err(unavailable)?;
        Ok(Self {
            client,
            manager,
            join_script: Script::new(JOIN_LUA),
            heartbeat_script: Script::new(HEARTBEAT_LUA),
            leave_script: Script::new(LEAVE_LUA),
        })
    }

    /// Room-family keys in the order every script expects after the conn key.
    fn room_keys(room_id: &str) -> [String; 4] {
        [
            keys::room_conns(room_id),
            keys::room_members(room_id),
            keys::room_last_seen(room_id),
            keys::room_conn_meta(room_id),
        ]
    }
}

fn parse_epoch(reply: &[String], idx: usize, what: &str) -> Result<i64> {
    reply
        .get(idx)
        .and_then(|e| e.parse::<i64>().ok())
        .ok_or_else(|| malformed(what))
}

#[async_trait]
impl Store for RedisStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut cm = self.manager.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut cm)
            .await
            .map_err(unavailable)
    }

    async fn hash_get_all_multi(&self, hash_keys: &[String]) -> Result<Vec<HashMap<String, String>>> {
        if hash_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cm = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in hash_keys {
            pipe.cmd("HGETALL").arg(key);
        }
        pipe.query_async(&mut cm).await.map_err(unavailable)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut cm = self.manager.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut cm)
            .await
            .map_err(unavailable)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut cm = self.manager.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut cm)
            .await
            .map_err(unavailable)
    }

    async fn sorted_range_below(&self, key: &str, cutoff: i64) -> Result<Vec<String>> {
        let mut cm = self.manager.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({cutoff}"))
            .query_async(&mut cm)
            .await
            .map_err(unavailable)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut cm = self.manager.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut cm)
            .await
            .map_err(unavailable)
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let client = self.client.clone();
        let pattern = pattern.to_string();
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(ps) => ps,
                    Err(e) => {
                        tracing::warn!(err = %e, "pubsub connect failed; retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.psubscribe(&pattern).await {
                    tracing::warn!(err = %e, "psubscribe failed; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(err = %e, %channel, "non-utf8 event payload dropped");
                            continue;
                        }
                    };
                    if tx.send(StoreMessage { channel, payload }).await.is_err() {
                        return;
                    }
                }
                tracing::warn!("pubsub stream ended; re-subscribing");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });
        Ok(Subscription::new(rx, task))
    }

    async fn apply_join(&self, w: &JoinWrite) -> Result<JoinOutcome> {
        let mut cm = self.manager.clone();
        let room = Self::room_keys(&w.room_id);
        let reply: Vec<String> = self
            .join_script
            .key(keys::conn(&w.conn_id))
            .key(&room[0])
            .key(&room[1])
            .key(&room[2])
            .key(&room[3])
            .key(keys::user_conns(&w.user_id))
            .key(keys::active_rooms())
            .arg(&w.room_id)
            .arg(&w.user_id)
            .arg(&w.conn_id)
            .arg(&w.state_json)
            .arg(w.now_ms)
            .arg(w.ttl_ms)
            .arg(w.prior_epoch.map(|e| e.to_string()).unwrap_or_default())
            .invoke_async(&mut cm)
            .await
            .map_err(unavailable)?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(JoinOutcome::Committed {
                epoch: parse_epoch(&reply, 1, "join")?,
            }),
            Some("rebound") => Ok(JoinOutcome::Rebound {
                current_room: reply.get(1).cloned().ok_or_else(|| malformed("join"))?,
            }),
            _ => Err(malformed("join")),
        }
    }

    async fn apply_heartbeat(&self, w: &HeartbeatWrite) -> Result<HeartbeatOutcome> {
        let mut cm = self.manager.clone();
        let reply: Vec<String> = self
            .heartbeat_script
            .key(keys::conn(&w.conn_id))
            .key(keys::room_last_seen(&w.room_id))
            .arg(&w.conn_id)
            .arg(w.expected_epoch)
            .arg(w.now_ms)
            .arg(w.ttl_ms)
            .arg(w.state_json.as_deref().unwrap_or(""))
            .invoke_async(&mut cm)
            .await
            .map_err(unavailable)?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(HeartbeatOutcome::Applied {
                epoch: parse_epoch(&reply, 1, "heartbeat")?,
            }),
            Some("stale") => Ok(HeartbeatOutcome::Stale {
                epoch: parse_epoch(&reply, 1, "heartbeat")?,
            }),
            Some("missing") => Ok(HeartbeatOutcome::Missing),
            _ => Err(malformed("heartbeat")),
        }
    }

    async fn apply_leave(&self, w: &LeaveWrite) -> Result<LeaveOutcome> {
        let mut cm = self.manager.clone();
        let room = Self::room_keys(&w.room_id);
        let stale_arg = w.stale_before.map(|c| c.to_string()).unwrap_or_default();
        let reply: Vec<String> = self
            .leave_script
            .key(keys::conn(&w.conn_id))
            .key(&room[0])
            .key(&room[1])
            .key(&room[2])
            .key(&room[3])
            .key(keys::user_conns(&w.user_id))
            .key(keys::active_rooms())
            .arg(&w.conn_id)
            .arg(&w.room_id)
            .arg(&w.user_id)
            .arg(stale_arg)
            .invoke_async(&mut cm)
            .await
            .map_err(unavailable)?;
        match reply.first().map(String::as_str) {
            Some("removed") => Ok(LeaveOutcome::Removed {
                user_id: reply.get(1).cloned().ok_or_else(|| malformed("leave"))?,
                epoch: parse_epoch(&reply, 2, "leave")?,
            }),
            Some("fresh") => Ok(LeaveOutcome::Fresh),
            Some("moved") => Ok(LeaveOutcome::Moved {
                current_room: reply.get(1).cloned().ok_or_else(|| malformed("leave"))?,
            }),
            Some("missing") => Ok(LeaveOutcome::Missing),
            _ => Err(malformed("leave")),
        }
    }
}
