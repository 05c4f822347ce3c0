//! WebSocket session loop.
//!
//! Responsibilities:
//! - Upgrade HTTP -> WS and assign the socket its stable conn id
//! - Per-session tracing span
//! - Heartbeat ping + idle timeout
//! - Serial decode -> dispatch -> ack per inbound frame
//! - Disconnect cleanup: local roster/registry teardown plus the synthetic
//!   presence leave (best-effort, errors logged)

use axum::{
    extract::{ws::WebSocket, ws::WebSocketUpgrade, State},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use presmesh_core::protocol::presence::MAX_STATE_BYTES;

use crate::app_state::AppState;
use crate::realtime::{Connection, SessionCtx};
use crate::services::presence::OP_DEADLINE;
use crate::transport::codec;

/// Inbound frames larger than a maximal state object plus envelope overhead
/// are rejected before parsing the payload.
const MAX_FRAME_BYTES: usize = MAX_STATE_BYTES + 4096;

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    // The socket id doubles as the presence connId; clients never supply one.
    let conn_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("ws_session", conn = %conn_id);
    run_session(state, conn_id, socket).instrument(span).await;
}

async fn run_session(state: AppState, conn_id: String, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound queue (writer task).
    let (out_tx, mut out_rx) = mpsc::channel::<axum::extract::ws::Message>(1024);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    state.sessions().insert(
        conn_id.clone(),
        Connection { tx: out_tx.clone() },
    );
    state.metrics().sessions_active.inc();

    let ctx = SessionCtx::new(conn_id.clone(), state.roster().clone());

    let ping_interval = Duration::from_millis(state.cfg().gateway.ping_interval_ms);
    let idle_timeout = Duration::from_millis(state.cfg().gateway.idle_timeout_ms);

    let mut last_rx = Instant::now();
    let mut ping_tick = tokio::time::interval(ping_interval);

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                // Proactive ping; if the client is dead the writer fails
                // eventually.
                let _ = out_tx.try_send(axum::extract::ws::Message::Ping(Vec::new()));
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(msg)) => {
                        last_rx = Instant::now();

                        match codec::decode(msg) {
                            Ok(codec::Inbound::Ping(v)) => {
                                let _ = out_tx.try_send(axum::extract::ws::Message::Pong(v));
                            }
                            Ok(codec::Inbound::Pong(_)) => {}
                            Ok(codec::Inbound::Close) => break,
                            Ok(codec::Inbound::Frame { env, bytes_len }) => {
                                let svc = env.svc.clone();
                                let seq = env.seq;
                                let ack_data = if bytes_len > MAX_FRAME_BYTES {
                                    tracing::warn!(bytes_len, "oversized frame rejected");
                                    json!({ "ok": false, "error": presmesh_core::ErrorKind::InvalidArgument.as_str() })
                                } else {
                                    match state.dispatcher().dispatch(ctx.clone(), env).await {
                                        Ok(data) => data,
                                        Err(e) => {
                                            tracing::debug!(code = %e.kind().as_str(), err = %e, "request failed");
                                            json!({ "ok": false, "error": e.kind().as_str() })
                                        }
                                    }
                                };
                                let ack = json!({
                                    "v": 1,
                                    "svc": svc,
                                    "type": "ack",
                                    "seq": seq,
                                    "data": ack_data,
                                });
                                match serde_json::to_string(&ack) {
                                    Ok(s) => {
                                        let _ = out_tx.send(axum::extract::ws::Message::Text(s)).await;
                                    }
                                    Err(e) => tracing::warn!(err = %e, "ack encode failed"),
                                }
                            }
                            Err(e) => {
                                state.metrics().decode_errors_total.inc();
                                tracing::warn!(code = %e.kind().as_str(), err = %e, "decode failed");
                            }
                        }
                    }
                    Some(Err(_e)) => break,
                    None => break,
                }
            }

            _ = tokio::time::sleep_until(last_rx + idle_timeout) => {
                tracing::info!("idle timeout; closing");
                break;
            }
        }
    }

    // Synthetic leave for whatever room the socket was bound to. Best-effort:
    // store errors are logged, never surfaced.
    if let Some(bound) = ctx.unbind_room() {
        let leave = state
            .presence()
            .leave(&conn_id, Some(bound.room_id.as_str()));
        match tokio::time::timeout(OP_DEADLINE, leave).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(err = %e, room = %bound.room_id, "disconnect leave failed");
            }
            Err(_) => {
                tracing::warn!(room = %bound.room_id, "disconnect leave timed out");
            }
        }
    }

    state.sessions().remove(&conn_id);
    state.metrics().sessions_active.dec();

    let _ = out_tx.send(axum::extract::ws::Message::Close(None)).await;
    writer.abort();
}
