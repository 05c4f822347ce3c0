//! Transport binding for the presence fabric.
//!
//! Translates `presence:join|heartbeat|leave` envelopes onto service calls.
//! The socket's stable id is the `connId` everywhere; ids, state size, and
//! epochs are validated here, and a socket belongs to at most one room at a
//! time. Service calls run under a fixed deadline so every request can be
//! acked in bounded time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use presmesh_core::protocol::envelope::Envelope;
use presmesh_core::protocol::presence::{
    HeartbeatRequest, JoinRequest, MAX_EPOCH, MAX_ID_BYTES, MAX_STATE_BYTES,
};
use presmesh_core::state::StateMap;
use presmesh_core::{PresmeshError, Result};

use crate::dispatch::SocketService;
use crate::presence::PresenceService;
use crate::realtime::SessionCtx;

/// Deadline applied to every presence service call.
pub const OP_DEADLINE: Duration = Duration::from_secs(2);

pub fn validate_id(label: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_ID_BYTES {
        return Err(PresmeshError::InvalidArgument(format!(
            "{label} must be 1..={MAX_ID_BYTES} bytes"
        )));
    }
    Ok(())
}

pub fn validate_state(label: &str, state: &StateMap) -> Result<()> {
    let serialized = serde_json::to_string(state)
        .map_err(|e| PresmeshError::InvalidArgument(format!("{label} not serializable: {e}")))?;
    if serialized.len() > MAX_STATE_BYTES {
        return Err(PresmeshError::InvalidArgument(format!(
            "{label} exceeds {MAX_STATE_BYTES} bytes"
        )));
    }
    Ok(())
}

pub fn validate_epoch(epoch: i64) -> Result<()> {
    if !(0..=MAX_EPOCH).contains(&epoch) {
        return Err(PresmeshError::InvalidArgument(
            "epoch must be a non-negative integer below 2^53".to_string(),
        ));
    }
    Ok(())
}

fn parse_data<T: DeserializeOwned>(env: &Envelope, what: &str) -> Result<T> {
    let raw = env
        .data
        .as_ref()
        .ok_or_else(|| PresmeshError::InvalidArgument(format!("{what} requires data")))?;
    serde_json::from_str(raw.get())
        .map_err(|e| PresmeshError::InvalidArgument(format!("{what} invalid data: {e}")))
}

async fn with_deadline<T>(
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(OP_DEADLINE, fut).await {
        Ok(res) => res,
        Err(_) => Err(PresmeshError::StoreUnavailable(
            "operation deadline exceeded".to_string(),
        )),
    }
}

pub struct PresenceSocketService {
    service: Arc<PresenceService>,
}

impl PresenceSocketService {
    pub fn new(service: Arc<PresenceService>) -> Self {
        Self { service }
    }

    async fn join(&self, ctx: &SessionCtx, env: &Envelope) -> Result<Value> {
        let req: JoinRequest = parse_data(env, "presence:join")?;
        validate_id("roomId", &req.room_id)?;
        validate_id("userId", &req.user_id)?;
        if let Some(state) = &req.state {
            validate_state("state", state)?;
        }

        if let Some(bound) = ctx.binding() {
            if bound.room_id != req.room_id {
                return Err(PresmeshError::AlreadyJoinedOther(bound.room_id));
            }
        }

        let accepted = with_deadline(self.service.join(
            &req.room_id,
            &req.user_id,
            ctx.conn_id(),
            req.state,
        ))
        .await?;
        ctx.bind_room(&req.room_id, &req.user_id);

        Ok(json!({
            "ok": true,
            "snapshot": accepted.snapshot,
            "self": { "connId": ctx.conn_id(), "epoch": accepted.epoch },
        }))
    }

    async fn heartbeat(&self, ctx: &SessionCtx, env: &Envelope) -> Result<Value> {
        let req: HeartbeatRequest = match env.data.as_ref() {
            Some(_) => parse_data(env, "presence:heartbeat")?,
            None => HeartbeatRequest::default(),
        };
        if let Some(epoch) = req.epoch {
            validate_epoch(epoch)?;
        }
        if let Some(patch) = &req.patch_state {
            validate_state("patchState", patch)?;
        }

        let accepted = with_deadline(self.service.heartbeat(
            ctx.conn_id(),
            req.patch_state.as_ref(),
            req.epoch,
        ))
        .await?;

        Ok(json!({
            "ok": true,
            "changed": accepted.changed,
            "epoch": accepted.epoch,
        }))
    }

    async fn leave(&self, ctx: &SessionCtx) -> Result<Value> {
        let bound = ctx.binding();
        with_deadline(
            self.service
                .leave(ctx.conn_id(), bound.as_ref().map(|b| b.room_id.as_str())),
        )
        .await?;
        ctx.unbind_room();
        Ok(json!({ "ok": true }))
    }
}

#[async_trait]
impl SocketService for PresenceSocketService {
    fn svc(&self) -> &'static str {
        "presence"
    }

    async fn handle(&self, ctx: SessionCtx, env: Envelope) -> Result<Value> {
        match env.msg_type.as_str() {
            "join" => self.join(&ctx, &env).await,
            "heartbeat" => self.heartbeat(&ctx, &env).await,
            "leave" => self.leave(&ctx).await,
            other => Err(PresmeshError::InvalidArgument(format!(
                "unknown presence type: {other}"
            ))),
        }
    }
}
