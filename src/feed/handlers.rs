//! Feed lifecycle log handlers
//!
//! One place for the log lines emitted on connection and subscription events,
//! so transports and the manager report them identically.

use crate::brokers::types::{DepthSnapshot, Tick};
use crate::feed::manager::ConnectionState;
use tracing::{debug, error, info, warn};

/// Handle market tick event
pub fn on_market_tick(tick: &Tick) {
    debug!(
        "Tick ({:?}): {}:{} LTP: {:.2} Vol: {}",
        tick.source,
        tick.exchange,
        tick.symbol,
        tick.ltp,
        tick.volume.unwrap_or_default()
    );
}

/// Handle market depth event
pub fn on_market_depth(depth: &DepthSnapshot) {
    debug!(
        "Depth: {}:{} Buy: {} levels, Sell: {} levels",
        depth.exchange,
        depth.symbol,
        depth.bids.len(),
        depth.asks.len()
    );
}

/// Handle push transport connection event
pub fn on_connected(broker_id: &str) {
    info!("WebSocket connected to broker: {}", broker_id);
}

/// Handle push transport disconnection event
pub fn on_disconnected(broker_id: &str, reason: Option<&str>) {
    match reason {
        Some(r) => warn!("WebSocket disconnected from {}: {}", broker_id, r),
        None => info!("WebSocket disconnected from {}", broker_id),
    }
}

/// Handle push transport error event
pub fn on_error(broker_id: &str, error: &str) {
    error!("WebSocket error ({}): {}", broker_id, error);
}

/// Handle subscription confirmation
pub fn on_subscribed(broker_id: &str, symbols: &[String]) {
    info!(
        "Subscribed to {} symbols on {}: {:?}",
        symbols.len(),
        broker_id,
        symbols.iter().take(5).collect::<Vec<_>>()
    );
}

/// Handle unsubscription confirmation
pub fn on_unsubscribed(broker_id: &str, symbols: &[String]) {
    info!("Unsubscribed from {} symbols on {}", symbols.len(), broker_id);
}

/// Handle reconnection attempt
pub fn on_reconnecting(broker_id: &str, attempt: u32) {
    warn!("Attempting to reconnect to {} WebSocket (attempt {})", broker_id, attempt);
}

/// Handle connection state transition
pub fn on_state_change(broker_id: &str, from: ConnectionState, to: ConnectionState) {
    info!("Market data feed ({}): {:?} -> {:?}", broker_id, from, to);
}
