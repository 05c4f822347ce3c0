//! Reaper convergence and runtime lifecycle.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use presmesh_core::protocol::presence::{EventKind, PresenceEvent};
use presmesh_gateway::obs::PresenceMetrics;
use presmesh_gateway::presence::{PresenceOptions, PresenceRuntime};
use presmesh_gateway::realtime::{RoomEgress, RoomRoster, SessionRegistry};
use presmesh_gateway::store::memory::MemoryStore;
use presmesh_gateway::store::{keys, Store, Subscription};

async fn start_runtime(
    store: Arc<MemoryStore>,
    opts: PresenceOptions,
) -> Arc<PresenceRuntime> {
    let metrics = Arc::new(PresenceMetrics::default());
    let egress = Arc::new(RoomEgress::new(
        Arc::new(SessionRegistry::new()),
        Arc::new(RoomRoster::new()),
        Arc::clone(&metrics),
    ));
    Arc::new(
        PresenceRuntime::start(store, egress, opts, metrics)
            .await
            .unwrap(),
    )
}

async fn drain_events(sub: &mut Subscription) -> Vec<PresenceEvent> {
    let mut events = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
        events.push(serde_json::from_str(&msg.payload).unwrap());
    }
    events
}

#[tokio::test]
async fn silent_connections_are_reaped_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let opts = PresenceOptions {
        ttl_ms: 100,
        reaper_interval_ms: 150,
        reaper_lookback_ms: 50,
        ..PresenceOptions::default()
    };
    let runtime = start_runtime(Arc::clone(&store), opts).await;

    let mut sub = store.subscribe(&keys::room_events_pattern()).await.unwrap();
    let service = runtime.service();
    service.join("R4", "u1", "c1", None).await.unwrap();
    service.join("R4", "u2", "c2", None).await.unwrap();

    // No heartbeats: both connections outlive their TTL and go stale.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(store
        .set_members(&keys::room_conns("R4"))
        .await
        .unwrap()
        .is_empty());
    assert!(!store
        .set_members(&keys::active_rooms())
        .await
        .unwrap()
        .contains(&"R4".to_string()));

    let events = drain_events(&mut sub).await;
    let mut reaped: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::Leave)
        .map(|e| e.conn_id.clone())
        .collect();
    reaped.sort();
    assert_eq!(reaped, vec!["c1", "c2"], "exactly one leave per connection");

    runtime.dispose().await;
}

#[tokio::test]
async fn heartbeats_keep_a_connection_alive() {
    let store = Arc::new(MemoryStore::new());
    let opts = PresenceOptions {
        ttl_ms: 100,
        reaper_interval_ms: 60,
        reaper_lookback_ms: 100,
        ..PresenceOptions::default()
    };
    let runtime = start_runtime(Arc::clone(&store), opts).await;

    let service = runtime.service();
    let joined = service.join("Rlive", "u", "c", None).await.unwrap();

    for _ in 0..12 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        service
            .heartbeat("c", None, Some(joined.epoch))
            .await
            .unwrap();
    }

    let conns = store.set_members(&keys::room_conns("Rlive")).await.unwrap();
    assert_eq!(conns, vec!["c"], "a heartbeating connection is never reaped");

    runtime.dispose().await;
}

#[tokio::test]
async fn dispose_is_idempotent_and_stops_the_reaper() {
    let store = Arc::new(MemoryStore::new());
    let opts = PresenceOptions {
        ttl_ms: 50,
        reaper_interval_ms: 40,
        reaper_lookback_ms: 30,
        ..PresenceOptions::default()
    };
    let runtime = start_runtime(Arc::clone(&store), opts).await;

    let service = runtime.service();
    service.join("Rd", "u", "c", None).await.unwrap();

    runtime.dispose().await;
    runtime.dispose().await;

    // With the reaper stopped, stale state stays until someone asks again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let conns = store.set_members(&keys::room_conns("Rd")).await.unwrap();
    assert_eq!(conns, vec!["c"]);
}
