use std::time::Duration;

use thiserror::Error;
use worldstate_core::StateError;

/// Connection-level failures reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("authentication rejected")]
    Auth,
    #[error("transport closed")]
    Closed,
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Errors surfaced to callers of the mirror.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The deadline passed before the wait was satisfied.
    #[error("wait timed out after {after:?}")]
    WaitTimeout { after: Duration },

    /// The world was reset (disconnect) while the wait was pending.
    #[error("world state was reset")]
    WorldReset,

    /// The mirror was shut down or dropped.
    #[error("world mirror stopped")]
    MirrorStopped,

    /// A command was rejected before reaching the transport.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// A request/response reply could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Protocol violations observed on the state channel. Logged, never returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("tick regression: completed {current}, received {received}")]
    TickRegression { current: u64, received: u64 },
}
