//! OpenAlgo Feed - real-time market data layer
//!
//! Streams ticks for subscribed instruments from Indian brokers
//! (Angel One, Zerodha) over their push transports, and keeps the stream
//! alive by polling REST quotes whenever the push channel is down.

pub mod brokers;
pub mod config;
pub mod error;
pub mod feed;
pub mod scheduler;
pub mod services;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use brokers::types::{DepthSnapshot, Exchange, InstrumentKey, SubscriptionMode, Tick, Token};
pub use config::FeedConfig;
pub use error::{AppError, Result};
pub use feed::{ConnectionState, MarketDataManager, MarketDataSink};

/// Initialize tracing/logging. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openalgo_feed=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
