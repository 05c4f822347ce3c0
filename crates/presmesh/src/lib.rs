//! Top-level facade crate for presmesh.
//!
//! Re-exports core types and the gateway library so users can depend on a single crate.

pub mod core {
    pub use presmesh_core::*;
}

pub mod gateway {
    pub use presmesh_gateway::*;
}
