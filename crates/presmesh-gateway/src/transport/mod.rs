//! Socket transport: decode-once codec and the WebSocket session loop.

pub mod codec;
pub mod ws;
