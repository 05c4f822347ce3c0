//! Transport binding: validation limits, single-room enforcement, and ack
//! bodies, exercised through the dispatcher exactly as the socket loop does.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;

use presmesh_core::protocol::envelope::Envelope;
use presmesh_core::ErrorKind;
use presmesh_gateway::dispatch::Dispatcher;
use presmesh_gateway::obs::PresenceMetrics;
use presmesh_gateway::presence::{PresenceOptions, PresenceService};
use presmesh_gateway::realtime::{RoomRoster, SessionCtx};
use presmesh_gateway::services::presence::PresenceSocketService;
use presmesh_gateway::store::memory::MemoryStore;

fn env(json: &str) -> Envelope {
    serde_json::from_str(json).unwrap()
}

struct Fixture {
    dispatcher: Dispatcher,
    roster: Arc<RoomRoster>,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(PresenceService::new(
            store,
            PresenceOptions::default(),
            Arc::new(PresenceMetrics::default()),
        ));
        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(PresenceSocketService::new(service)));
        Self {
            dispatcher,
            roster: Arc::new(RoomRoster::new()),
        }
    }

    fn ctx(&self, conn_id: &str) -> SessionCtx {
        SessionCtx::new(conn_id.to_string(), Arc::clone(&self.roster))
    }
}

#[tokio::test]
async fn join_ack_carries_snapshot_and_self() {
    let fx = Fixture::new();
    let ctx = fx.ctx("sock-1");

    let data = fx
        .dispatcher
        .dispatch(
            ctx.clone(),
            env(r#"{"v":1,"svc":"presence","type":"join","seq":1,"data":{"roomId":"R","userId":"u","state":{"mic":true}}}"#),
        )
        .await
        .unwrap();

    assert_eq!(data["ok"], true);
    assert_eq!(data["snapshot"].as_array().unwrap().len(), 1);
    assert_eq!(data["snapshot"][0]["connId"], "sock-1");
    assert_eq!(data["snapshot"][0]["state"]["mic"], true);
    assert_eq!(data["self"]["connId"], "sock-1");
    assert!(data["self"]["epoch"].as_i64().unwrap() > 0);
    assert_eq!(ctx.binding().unwrap().room_id, "R");
}

#[tokio::test]
async fn second_room_is_rejected_while_bound() {
    let fx = Fixture::new();
    let ctx = fx.ctx("sock-1");

    fx.dispatcher
        .dispatch(
            ctx.clone(),
            env(r#"{"v":1,"svc":"presence","type":"join","data":{"roomId":"R1","userId":"u"}}"#),
        )
        .await
        .unwrap();

    let err = fx
        .dispatcher
        .dispatch(
            ctx.clone(),
            env(r#"{"v":1,"svc":"presence","type":"join","data":{"roomId":"R2","userId":"u"}}"#),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyJoinedOther);

    // Re-joining the bound room is the reconnect path and stays allowed.
    let data = fx
        .dispatcher
        .dispatch(
            ctx.clone(),
            env(r#"{"v":1,"svc":"presence","type":"join","data":{"roomId":"R1","userId":"u"}}"#),
        )
        .await
        .unwrap();
    assert_eq!(data["ok"], true);
}

#[tokio::test]
async fn leave_then_join_another_room_is_allowed() {
    let fx = Fixture::new();
    let ctx = fx.ctx("sock-1");

    fx.dispatcher
        .dispatch(
            ctx.clone(),
            env(r#"{"v":1,"svc":"presence","type":"join","data":{"roomId":"R1","userId":"u"}}"#),
        )
        .await
        .unwrap();
    let data = fx
        .dispatcher
        .dispatch(
            ctx.clone(),
            env(r#"{"v":1,"svc":"presence","type":"leave"}"#),
        )
        .await
        .unwrap();
    assert_eq!(data["ok"], true);
    assert!(ctx.binding().is_none());

    fx.dispatcher
        .dispatch(
            ctx.clone(),
            env(r#"{"v":1,"svc":"presence","type":"join","data":{"roomId":"R2","userId":"u"}}"#),
        )
        .await
        .unwrap();
    assert_eq!(ctx.binding().unwrap().room_id, "R2");
}

#[tokio::test]
async fn invalid_arguments_are_rejected() {
    let fx = Fixture::new();

    // Empty roomId.
    let err = fx
        .dispatcher
        .dispatch(
            fx.ctx("s1"),
            env(r#"{"v":1,"svc":"presence","type":"join","data":{"roomId":"","userId":"u"}}"#),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Oversized userId.
    let long = "x".repeat(300);
    let err = fx
        .dispatcher
        .dispatch(
            fx.ctx("s2"),
            env(&format!(
                r#"{{"v":1,"svc":"presence","type":"join","data":{{"roomId":"R","userId":"{long}"}}}}"#
            )),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Negative epoch.
    let err = fx
        .dispatcher
        .dispatch(
            fx.ctx("s3"),
            env(r#"{"v":1,"svc":"presence","type":"heartbeat","data":{"epoch":-5}}"#),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Oversized state object.
    let blob = "y".repeat(70 * 1024);
    let err = fx
        .dispatcher
        .dispatch(
            fx.ctx("s4"),
            env(&format!(
                r#"{{"v":1,"svc":"presence","type":"join","data":{{"roomId":"R","userId":"u","state":{{"blob":"{blob}"}}}}}}"#
            )),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Unknown service and unknown type.
    let err = fx
        .dispatcher
        .dispatch(fx.ctx("s5"), env(r#"{"v":1,"svc":"chat","type":"send"}"#))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = fx
        .dispatcher
        .dispatch(
            fx.ctx("s6"),
            env(r#"{"v":1,"svc":"presence","type":"poke"}"#),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn heartbeat_before_join_is_unknown_connection() {
    let fx = Fixture::new();
    let err = fx
        .dispatcher
        .dispatch(
            fx.ctx("sock-1"),
            env(r#"{"v":1,"svc":"presence","type":"heartbeat","data":{}}"#),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownConnection);
}

#[tokio::test]
async fn leave_without_binding_still_acks_ok() {
    let fx = Fixture::new();
    let data = fx
        .dispatcher
        .dispatch(
            fx.ctx("sock-1"),
            env(r#"{"v":1,"svc":"presence","type":"leave"}"#),
        )
        .await
        .unwrap();
    assert_eq!(data["ok"], true);
}
