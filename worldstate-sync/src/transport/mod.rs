//! Transport seam.
//!
//! The mirror needs four things from its transport: a long-lived channel
//! subscription that also reports connection state, key reads, list pushes and
//! blocking list pops. Anything offering those (a Redis client, an in-process
//! broker) plugs in through [`TransportFactory`].

mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::Endpoint;
use crate::error::TransportError;

pub use memory::{MemoryBroker, MemoryTransport};

/// What a channel subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is (re-)established and the subscription is live.
    Ready,
    /// One raw payload published on the channel.
    Message(Vec<u8>),
    /// The connection dropped. A `Ready` follows if it comes back.
    Closed,
}

/// Subscription stream. Ends only when the transport is gone for good.
pub type EventStream = BoxStream<'static, TransportEvent>;

/// One connection to the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribes to `channel`. The stream outlives reconnects.
    fn subscribe(&self, channel: &str) -> EventStream;

    /// Reads a key. `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError>;

    /// Appends to a list, returning its new length.
    async fn rpush(&self, list: &str, value: Vec<u8>) -> Result<usize, TransportError>;

    /// Pops the head of a list, waiting up to `timeout` (forever if `None`)
    /// for an element. `Ok(None)` means the timeout elapsed.
    async fn blpop(
        &self,
        list: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Opens transport connections. Injected into the mirror.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError>;
}
