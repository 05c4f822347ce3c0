//! Egress engine: send to a single socket or broadcast to a room's local
//! sockets.
//!
//! Presence broadcasts are lossy by contract (clients converge via
//! snapshots), so delivery is try_send with sampled drop accounting.

use std::sync::Arc;

use axum::extract::ws::Message;
use presmesh_core::{PresmeshError, Result};
use serde_json::Value;

use crate::obs::PresenceMetrics;
use crate::realtime::{RoomRoster, SessionRegistry};

fn sample_every_1024(n: u64) -> bool {
    (n & 1023) == 1
}

pub struct RoomEgress {
    sessions: Arc<SessionRegistry>,
    roster: Arc<RoomRoster>,
    metrics: Arc<PresenceMetrics>,
}

impl RoomEgress {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        roster: Arc<RoomRoster>,
        metrics: Arc<PresenceMetrics>,
    ) -> Self {
        Self {
            sessions,
            roster,
            metrics,
        }
    }

    /// Serialize once, then try_send to every local socket in the room.
    pub fn broadcast_room(&self, room_id: &str, frame: &Value) -> Result<()> {
        let prepared = serde_json::to_string(frame)
            .map_err(|e| PresmeshError::Internal(format!("frame encode failed: {e}")))?;
        for conn_id in self.roster.conns_in(room_id) {
            if let Some(conn) = self.sessions.get(&conn_id) {
                if conn.tx.try_send(Message::Text(prepared.clone())).is_err() {
                    self.metrics.fanout_drops_total.inc();
                    let n = self.metrics.fanout_drops_total.get();
                    if sample_every_1024(n) {
                        tracing::warn!(room = %room_id, drops = %n, "egress drop (queue full)");
                    }
                }
            }
        }
        Ok(())
    }

    pub fn send_to_conn(&self, conn_id: &str, frame: &Value) -> Result<()> {
        let conn = self
            .sessions
            .get(conn_id)
            .ok_or_else(|| PresmeshError::UnknownConnection(conn_id.to_string()))?;
        let prepared = serde_json::to_string(frame)
            .map_err(|e| PresmeshError::Internal(format!("frame encode failed: {e}")))?;
        let _ = conn.tx.try_send(Message::Text(prepared));
        Ok(())
    }
}
