//! Market data sinks
//!
//! The manager hands every normalized tick, depth snapshot and state change
//! to a [`MarketDataSink`]. Sinks are called from the event loop task and
//! must not block.

use crate::brokers::types::{DepthSnapshot, Tick};
use crate::feed::handlers;
use crate::feed::manager::ConnectionState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Consumer of the feed's output
pub trait MarketDataSink: Send + Sync {
    fn on_tick(&self, tick: Tick);

    fn on_depth(&self, depth: DepthSnapshot);

    fn on_connection_state_change(&self, state: ConnectionState);
}

/// Serializable event for UI / IPC consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedEvent {
    Tick(Tick),
    Depth(DepthSnapshot),
    State(ConnectionState),
}

/// Fans events out over a tokio broadcast channel.
///
/// Slow receivers lag and lose the oldest events; the feed never waits.
pub struct BroadcastSink {
    sender: broadcast::Sender<FeedEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: FeedEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

impl MarketDataSink for BroadcastSink {
    fn on_tick(&self, tick: Tick) {
        self.publish(FeedEvent::Tick(tick));
    }

    fn on_depth(&self, depth: DepthSnapshot) {
        self.publish(FeedEvent::Depth(depth));
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        self.publish(FeedEvent::State(state));
    }
}

/// Writes everything to the tracing log
#[derive(Debug, Default)]
pub struct LoggingSink;

impl MarketDataSink for LoggingSink {
    fn on_tick(&self, tick: Tick) {
        handlers::on_market_tick(&tick);
    }

    fn on_depth(&self, depth: DepthSnapshot) {
        handlers::on_market_depth(&depth);
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        tracing::info!("Market data feed is {:?}", state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::types::*;

    fn tick() -> Tick {
        Tick {
            symbol: "SBIN".to_string(),
            exchange: Exchange::Nse,
            token: Token::new(3045).unwrap(),
            mode: SubscriptionMode::Ltp,
            ltp: 571.8,
            bid: None,
            ask: None,
            bid_qty: None,
            ask_qty: None,
            last_qty: None,
            average_price: None,
            volume: None,
            open_interest: None,
            ohlc: None,
            depth: None,
            timestamp: 1_700_000_000_000,
            source: TickSource::Poll,
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_in_order() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();

        sink.on_connection_state_change(ConnectionState::Degraded);
        sink.on_tick(tick());

        assert_eq!(rx.recv().await.unwrap(), FeedEvent::State(ConnectionState::Degraded));
        assert_eq!(rx.recv().await.unwrap(), FeedEvent::Tick(tick()));
    }

    #[test]
    fn test_broadcast_without_receivers() {
        let sink = BroadcastSink::new(0);
        sink.on_tick(tick());
    }

    #[test]
    fn test_event_serialization() {
        let value = serde_json::to_value(FeedEvent::Tick(tick())).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["data"]["exchange"], "NSE");
        assert_eq!(value["data"]["mode"], "ltp");
        assert_eq!(value["data"]["token"], 3045);
        assert_eq!(value["data"]["source"], "poll");

        let value = serde_json::to_value(FeedEvent::State(ConnectionState::Live)).unwrap();
        assert_eq!(value["data"], "live");
    }
}
