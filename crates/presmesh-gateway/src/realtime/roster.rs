use dashmap::{DashMap, DashSet};

/// Node-local room roster: room -> conn_ids, conn -> room.
///
/// Tracks only the sockets on this node, for event fan-out targeting. A
/// socket belongs to at most one room at a time, so the reverse index is a
/// plain map.
#[derive(Default)]
pub struct RoomRoster {
    room_to_conns: DashMap<String, DashSet<String>>,
    conn_to_room: DashMap<String, String>,
}

impl RoomRoster {
    pub fn new() -> Self {
        Self {
            room_to_conns: DashMap::new(),
            conn_to_room: DashMap::new(),
        }
    }

    /// Associate a socket with a room, replacing any previous association.
    pub fn bind(&self, conn_id: &str, room_id: &str) {
        self.unbind(conn_id);
        self.room_to_conns
            .entry(room_id.to_string())
            .or_insert_with(DashSet::new)
            .insert(conn_id.to_string());
        self.conn_to_room
            .insert(conn_id.to_string(), room_id.to_string());
    }

    /// Drop a socket's association. Returns the room it was bound to.
    pub fn unbind(&self, conn_id: &str) -> Option<String> {
        let (_, room) = self.conn_to_room.remove(conn_id)?;
        if let Some(set) = self.room_to_conns.get(&room) {
            set.remove(conn_id);
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.room_to_conns
                    .remove_if(&room, |_, conns| conns.is_empty());
            }
        }
        Some(room)
    }

    pub fn conns_in(&self, room_id: &str) -> Vec<String> {
        self.room_to_conns
            .get(room_id)
            .map(|set| set.iter().map(|c| c.to_string()).collect())
            .unwrap_or_default()
    }
}
