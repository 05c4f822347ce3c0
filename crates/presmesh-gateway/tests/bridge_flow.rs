//! Event bridge fan-out: handler isolation and room-scoped delivery.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use presmesh_core::protocol::presence::PresenceEvent;
use presmesh_core::{PresmeshError, Result};
use presmesh_gateway::obs::PresenceMetrics;
use presmesh_gateway::presence::{
    EventBridge, EventName, PresenceHandler, PresenceOptions, PresenceService,
};
use presmesh_gateway::realtime::{Connection, RoomEgress, RoomRoster, SessionRegistry};
use presmesh_gateway::store::memory::MemoryStore;
use presmesh_gateway::store::Store;
use tokio::sync::mpsc;

struct Counting(AtomicUsize);

impl PresenceHandler for Counting {
    fn on_event(&self, _event: &PresenceEvent) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

impl PresenceHandler for Failing {
    fn on_event(&self, _event: &PresenceEvent) -> Result<()> {
        Err(PresmeshError::Internal("this handler always fails".into()))
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    sessions: Arc<SessionRegistry>,
    roster: Arc<RoomRoster>,
    bridge: EventBridge,
    service: PresenceService,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(PresenceMetrics::default());
    let sessions = Arc::new(SessionRegistry::new());
    let roster = Arc::new(RoomRoster::new());
    let egress = Arc::new(RoomEgress::new(
        Arc::clone(&sessions),
        Arc::clone(&roster),
        Arc::clone(&metrics),
    ));
    let bridge = EventBridge::start(
        store.clone(),
        egress,
        EventName::default(),
        Arc::clone(&metrics),
    )
    .await
    .unwrap();
    let service = PresenceService::new(
        store.clone(),
        PresenceOptions::default(),
        metrics,
    );
    Fixture {
        store,
        sessions,
        roster,
        bridge,
        service,
    }
}

/// Attach a simulated local socket bound to `room`.
fn attach_socket(fx: &Fixture, conn_id: &str, room: &str) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(16);
    fx.sessions.insert(conn_id.to_string(), Connection { tx });
    fx.roster.bind(conn_id, room);
    rx
}

async fn recv_frame(rx: &mut mpsc::Receiver<Message>) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("frame expected")
        .expect("socket open");
    match msg {
        Message::Text(s) => serde_json::from_str(&s).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn events_reach_local_sockets_in_the_room() {
    let fx = fixture().await;
    let mut rx = attach_socket(&fx, "c-local", "roomA");

    fx.service
        .join("roomA", "u-remote", "c-remote", None)
        .await
        .unwrap();

    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame["svc"], "presence");
    assert_eq!(frame["type"], "event");
    assert_eq!(frame["room"], "roomA");
    assert_eq!(frame["data"]["type"], "join");
    assert_eq!(frame["data"]["connId"], "c-remote");

    fx.bridge.stop().await;
}

#[tokio::test]
async fn no_cross_room_delivery() {
    let fx = fixture().await;
    let mut rx_a = attach_socket(&fx, "c-a", "roomA");
    let mut rx_b = attach_socket(&fx, "c-b", "roomB");

    fx.service.join("roomA", "u1", "c1", None).await.unwrap();

    let frame = recv_frame(&mut rx_a).await;
    assert_eq!(frame["room"], "roomA");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        rx_b.try_recv().is_err(),
        "roomB sockets must never see roomA events"
    );

    fx.bridge.stop().await;
}

#[tokio::test]
async fn failing_handler_does_not_poison_the_bridge() {
    let fx = fixture().await;
    let counting = Arc::new(Counting(AtomicUsize::new(0)));
    fx.bridge.handlers().register(Arc::new(Failing));
    fx.bridge.handlers().register(counting.clone());

    let mut rx = attach_socket(&fx, "c-local", "roomA");

    fx.service.join("roomA", "u1", "c1", None).await.unwrap();
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame["data"]["type"], "join");
    assert!(counting.0.load(Ordering::SeqCst) >= 1, "later handlers still run");

    // A second operation still flows end to end, and no keys are orphaned.
    fx.service.leave("c1", None).await.unwrap();
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame["data"]["type"], "leave");
    assert!(fx
        .store
        .set_members(&presmesh_gateway::store::keys::room_conns("roomA"))
        .await
        .unwrap()
        .is_empty());

    fx.bridge.stop().await;
}
