//! Node-local realtime plumbing.
//!
//! The store is the authoritative registry; everything here only answers
//! "which sockets live on *this* node" so events can be fanned out to them.

pub mod ctx;
pub mod egress;
pub mod roster;
pub mod session_registry;

pub use ctx::{RoomBinding, SessionCtx};
pub use egress::RoomEgress;
pub use roster::RoomRoster;
pub use session_registry::{Connection, SessionRegistry};
