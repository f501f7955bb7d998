//! Real-time market data feed
//!
//! Resolves instruments, tracks subscriptions and keeps a tick stream flowing
//! from the broker's push transport, falling back to REST polling whenever
//! the push channel is down.

pub mod handlers;
pub mod manager;
pub mod normalizer;
pub mod registry;
pub mod resolver;
pub mod sink;
pub mod transport;

pub use manager::{ConnectionState, MarketDataManager};
pub use registry::{Subscription, SubscriptionRegistry};
pub use resolver::InstrumentResolver;
pub use sink::{BroadcastSink, FeedEvent, LoggingSink, MarketDataSink};
pub use transport::{PushTransport, TransportEvent, TransportStatus};
