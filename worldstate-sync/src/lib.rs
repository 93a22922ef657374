//! # worldstate-sync - live world mirror over a pub/sub transport
//!
//! Keeps a local copy of the authority's world state current and lets callers
//! wait for ticks and conditions on it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  channel "worldstate"   ┌──────────────┐
//! │  Authority  │ ──────────────────────► │  Lifecycle   │
//! │             │  key "worldstate"       │  (1 task)    │
//! │             │ ──────────────────────► └──────┬───────┘
//! │             │                                │
//! │             │  list "commands"        ┌──────▼───────┐
//! │             │ ◄────────────────────── │ TickPipeline │──► Store
//! └─────────────┘                         └──────┬───────┘
//!        ▲                                       │
//!        │ CommandChannel            waits ◄─────┼────► WorldEvent bus
//!        └──────────────── WorldMirror ◄─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: transport seam and the in-memory broker
//! - [`pipeline`]: serial tick application and reset
//! - `lifecycle`: connect, snapshot, steady state, resync (internal)
//! - [`wait`]: keyed condition waits
//! - [`command`]: change commands and legacy requests
//! - [`mirror`]: the public handle tying it together

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
mod lifecycle;
pub mod mirror;
pub mod pipeline;
pub mod stats;
pub mod transport;
pub mod wait;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{ChangeCommand, CommandChannel};
pub use config::{Endpoint, MirrorConfig};
pub use error::{ProtocolViolation, SyncError, TransportError};
pub use events::{TickReport, WorldEvent};
pub use mirror::WorldMirror;
pub use pipeline::Phase;
pub use stats::{PipelineStats, StatsSnapshot};
pub use transport::{
    EventStream, MemoryBroker, MemoryTransport, Transport, TransportEvent, TransportFactory,
};
pub use wait::{WaitKeys, WorldView};
