use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// One socket's outbound queue sender.
#[derive(Clone)]
pub struct Connection {
    pub tx: mpsc::Sender<Message>,
}

/// conn_id -> Connection for the sockets attached to this node.
#[derive(Default)]
pub struct SessionRegistry {
    conns: DashMap<String, Connection>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { conns: DashMap::new() }
    }

    pub fn insert(&self, conn_id: String, conn: Connection) {
        self.conns.insert(conn_id, conn);
    }

    pub fn remove(&self, conn_id: &str) {
        self.conns.remove(conn_id);
    }

    pub fn get(&self, conn_id: &str) -> Option<Connection> {
        self.conns.get(conn_id).map(|r| r.value().clone())
    }
}
