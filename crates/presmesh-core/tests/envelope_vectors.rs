//! Presence wire vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;

use presmesh_core::protocol::envelope::Envelope;
use presmesh_core::protocol::presence::{
    EventKind, HeartbeatRequest, JoinRequest, PresenceEvent,
};

fn load(name: &str) -> String {
    fs::read_to_string(format!("tests/vectors/{name}")).unwrap()
}

#[test]
fn parse_join_envelope() {
    let s = load("envelope_join.json");
    let env: Envelope = serde_json::from_str(&s).unwrap();
    assert_eq!(env.v, 1);
    assert_eq!(env.svc, "presence");
    assert_eq!(env.msg_type, "join");
    assert_eq!(env.seq, Some(7));

    let req: JoinRequest = serde_json::from_str(env.data.unwrap().get()).unwrap();
    assert_eq!(req.room_id, "lobby");
    assert_eq!(req.user_id, "u-alice");
    let state = req.state.unwrap();
    assert_eq!(state.get("mic"), Some(&serde_json::json!(true)));
    assert_eq!(state.get("camera"), Some(&serde_json::json!(false)));
}

#[test]
fn parse_heartbeat_minimal() {
    let s = load("envelope_heartbeat_min.json");
    let env: Envelope = serde_json::from_str(&s).unwrap();
    assert_eq!(env.msg_type, "heartbeat");

    let req: HeartbeatRequest = serde_json::from_str(env.data.unwrap().get()).unwrap();
    assert!(req.patch_state.is_none());
    assert!(req.epoch.is_none());
}

#[test]
fn client_supplied_conn_id_is_ignored() {
    // The socket id is the source of truth; a payload carrying connId still
    // parses and the field is simply dropped.
    let req: HeartbeatRequest =
        serde_json::from_str(r#"{"connId":"c-9","epoch":3}"#).unwrap();
    assert_eq!(req.epoch, Some(3));
}

#[test]
fn parse_leave_event() {
    let s = load("event_leave.json");
    let ev: PresenceEvent = serde_json::from_str(&s).unwrap();
    assert_eq!(ev.kind, EventKind::Leave);
    assert_eq!(ev.room_id, "lobby");
    assert_eq!(ev.conn_id, "c-1");
    assert!(ev.state.is_none());
}

#[test]
fn event_round_trips_without_state_field_on_leave() {
    let ev = PresenceEvent {
        kind: EventKind::Leave,
        room_id: "r".into(),
        user_id: "u".into(),
        conn_id: "c".into(),
        state: None,
        epoch: 5,
        ts: 6,
    };
    let s = serde_json::to_string(&ev).unwrap();
    assert!(!s.contains("\"state\""));
    assert!(s.contains("\"type\":\"leave\""));
}

#[test]
fn envelope_rejects_unknown_fields() {
    let bad = r#"{"v":1,"svc":"presence","type":"join","extra":true}"#;
    assert!(serde_json::from_str::<Envelope>(bad).is_err());
}
