//! Shared error type across presmesh crates.

use thiserror::Error;

/// Client-facing error kinds (stable API).
///
/// These are the exact strings carried in `{ok:false, error}` acks; a stale
/// heartbeat epoch is deliberately absent because it is folded into
/// `{changed:false}` and never surfaced as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request shape violates the wire validation rules.
    InvalidArgument,
    /// Socket attempted to join a second room.
    AlreadyJoinedOther,
    /// Heartbeat or leave addressed a connId with no live record.
    UnknownConnection,
    /// Transient backing-store failure (including op deadline expiry).
    StoreUnavailable,
    /// Any unhandled failure in the service or bridge.
    Internal,
}

impl ErrorKind {
    /// String representation used in JSON acks.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::AlreadyJoinedOther => "AlreadyJoinedOther",
            ErrorKind::UnknownConnection => "UnknownConnection",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, PresmeshError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum PresmeshError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("already joined room {0}")]
    AlreadyJoinedOther(String),
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl PresmeshError {
    /// Map internal error to a stable client-facing kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PresmeshError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PresmeshError::AlreadyJoinedOther(_) => ErrorKind::AlreadyJoinedOther,
            PresmeshError::UnknownConnection(_) => ErrorKind::UnknownConnection,
            PresmeshError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            PresmeshError::Internal(_) => ErrorKind::Internal,
        }
    }
}
