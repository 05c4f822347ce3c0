//! Cross-node event bridge.
//!
//! One pattern subscription per process. Every received event is handed to
//! the in-process handler set and broadcast to the room's local sockets.
//! Handlers are isolated: one failing handler is logged and the rest still
//! run.

use std::sync::{Arc, RwLock};

use presmesh_core::protocol::presence::PresenceEvent;
use presmesh_core::Result;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::obs::PresenceMetrics;
use crate::realtime::RoomEgress;
use crate::store::{keys, Store, Subscription};

use super::EventName;

/// In-process subscriber to presence events.
pub trait PresenceHandler: Send + Sync {
    fn on_event(&self, event: &PresenceEvent) -> Result<()>;
}

/// Read-mostly handler registry: registration takes the write lock, dispatch
/// snapshots the current set and iterates lock-free.
#[derive(Default)]
pub struct HandlerSet {
    inner: RwLock<Vec<Arc<dyn PresenceHandler>>>,
}

impl HandlerSet {
    pub fn register(&self, handler: Arc<dyn PresenceHandler>) {
        if let Ok(mut g) = self.inner.write() {
            g.push(handler);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn PresenceHandler>> {
        self.inner.read().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct EventBridge {
    handlers: Arc<HandlerSet>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBridge {
    /// Subscribe and start pumping events. The subscription lives on a
    /// dedicated subscribe-mode store connection and re-subscribes by itself
    /// after a backend reconnect (no back-fill; clients converge via
    /// snapshots).
    pub async fn start(
        store: Arc<dyn Store>,
        egress: Arc<RoomEgress>,
        event_name: EventName,
        metrics: Arc<PresenceMetrics>,
    ) -> Result<Self> {
        let subscription = store.subscribe(&keys::room_events_pattern()).await?;
        let handlers = Arc::new(HandlerSet::default());
        let shutdown = Arc::new(Notify::new());

        let task = tokio::spawn(pump(
            subscription,
            egress,
            event_name,
            Arc::clone(&handlers),
            metrics,
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            handlers,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn handlers(&self) -> &Arc<HandlerSet> {
        &self.handlers
    }

    /// Unsubscribe and drain. Safe to call more than once.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn pump(
    mut subscription: Subscription,
    egress: Arc<RoomEgress>,
    event_name: EventName,
    handlers: Arc<HandlerSet>,
    metrics: Arc<PresenceMetrics>,
    shutdown: Arc<Notify>,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.notified() => return,
            msg = subscription.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        let event: PresenceEvent = match serde_json::from_str(&msg.payload) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(err = %e, channel = %msg.channel, "undecodable presence event dropped");
                continue;
            }
        };
        metrics.events_received_total.inc();

        for handler in handlers.snapshot() {
            if let Err(e) = handler.on_event(&event) {
                metrics.handler_errors_total.inc();
                tracing::warn!(err = %e, room = %event.room_id, "presence handler failed");
            }
        }

        let room_id = event.room_id.clone();
        let frame = json!({
            "v": 1,
            "svc": event_name.svc,
            "type": event_name.kind,
            "room": room_id,
            "data": event,
        });
        if let Err(e) = egress.broadcast_room(&room_id, &frame) {
            tracing::warn!(err = %e, room = %room_id, "room broadcast failed");
        }
    }
}
