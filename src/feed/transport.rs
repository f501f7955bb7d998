//! Push transport interface consumed by the connection manager

use crate::brokers::{BrokerSession, WirePacket};
use crate::error::Result;
use crate::feed::registry::Subscription;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Connection status reported by a push transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected(Option<String>),
    Error(String),
}

/// Events a push transport delivers on its own task
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Tick(WirePacket),
    Depth(WirePacket),
    Status(TransportStatus),
}

/// Streaming channel to a broker (websocket in production, fakes in tests).
///
/// Implementations deliver ticks and status changes through the `events`
/// sender handed to [`connect`](PushTransport::connect) and must never block
/// the caller on socket I/O beyond the call itself.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Broker ID this transport speaks to
    fn broker_id(&self) -> &'static str;

    /// Open the stream. `Ok` means the session is established.
    async fn connect(
        &self,
        session: &BrokerSession,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()>;

    /// Start streaming one instrument at the given mode
    async fn subscribe(&self, subscription: &Subscription) -> Result<()>;

    /// Stop streaming one instrument
    async fn unsubscribe(&self, subscription: &Subscription) -> Result<()>;

    /// Close the stream; safe to call when already closed
    async fn disconnect(&self);
}
