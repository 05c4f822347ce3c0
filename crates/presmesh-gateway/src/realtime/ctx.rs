//! Per-message context passed to dispatch services.

use std::sync::{Arc, Mutex};

use crate::realtime::RoomRoster;

/// The room/user pair a socket is currently bound to.
#[derive(Debug, Clone)]
pub struct RoomBinding {
    pub room_id: String,
    pub user_id: String,
}

/// Handle onto one socket's session, cloned per inbound message.
///
/// The socket loop handles messages serially, so the binding cell is
/// uncontended in practice; the mutex only covers cross-task reads during
/// disconnect cleanup.
#[derive(Clone)]
pub struct SessionCtx {
    conn_id: Arc<str>,
    roster: Arc<RoomRoster>,
    binding: Arc<Mutex<Option<RoomBinding>>>,
}

impl SessionCtx {
    pub fn new(conn_id: impl Into<Arc<str>>, roster: Arc<RoomRoster>) -> Self {
        Self {
            conn_id: conn_id.into(),
            roster,
            binding: Arc::new(Mutex::new(None)),
        }
    }

    /// The socket's stable id; doubles as the connection's `connId`.
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn binding(&self) -> Option<RoomBinding> {
        self.binding.lock().ok().and_then(|g| g.clone())
    }

    /// Record the room association and register the socket in the local
    /// roster for event fan-out.
    pub fn bind_room(&self, room_id: &str, user_id: &str) {
        self.roster.bind(&self.conn_id, room_id);
        if let Ok(mut g) = self.binding.lock() {
            *g = Some(RoomBinding {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
    }

    /// Clear the room association. Returns the binding that was in force.
    pub fn unbind_room(&self) -> Option<RoomBinding> {
        self.roster.unbind(&self.conn_id);
        self.binding.lock().ok().and_then(|mut g| g.take())
    }
}
