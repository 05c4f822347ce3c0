//! Decode-once codec for the transport layer.
//!
//! - Text frames => Envelope (lazy `RawValue` for data)
//! - Ping/Pong/Close are surfaced for lifecycle management
//! - Binary frames are not part of the protocol

use axum::extract::ws::Message;
use presmesh_core::protocol::envelope::Envelope;
use presmesh_core::{PresmeshError, Result};

#[derive(Debug)]
pub enum Inbound {
    Frame { env: Envelope, bytes_len: usize },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub fn decode(msg: Message) -> Result<Inbound> {
    match msg {
        Message::Text(s) => {
            let bytes_len = s.as_bytes().len();
            let env: Envelope = serde_json::from_str(&s)
                .map_err(|e| PresmeshError::InvalidArgument(format!("invalid envelope json: {e}")))?;
            Ok(Inbound::Frame { env, bytes_len })
        }
        Message::Binary(_) => Err(PresmeshError::InvalidArgument(
            "binary frames are not supported".to_string(),
        )),
        Message::Ping(v) => Ok(Inbound::Ping(v)),
        Message::Pong(v) => Ok(Inbound::Pong(v)),
        Message::Close(_) => Ok(Inbound::Close),
    }
}
