//! Broker adapters module
//!
//! Each broker supplies two collaborators for the feed: a REST client
//! implementing [`Broker`] (quotes, master contract) and a push transport
//! implementing [`PushTransport`](crate::feed::PushTransport).

pub mod types;
pub(crate) mod de;
pub mod angel;
pub mod zerodha;

use crate::error::{AppError, Result};
use crate::feed::PushTransport;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use types::*;

/// Broker trait for the REST side of an adapter
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker ID (e.g., "angel", "zerodha")
    fn id(&self) -> &'static str;

    /// Broker display name
    fn name(&self) -> &'static str;

    /// Fetch a single quote by exchange and token
    async fn get_quote(&self, exchange: Exchange, token: Token) -> Result<QuotePayload>;

    /// Download master contract rows for one exchange
    async fn download_master_contract(&self, exchange: Exchange) -> Result<Vec<SymbolData>>;
}

/// Raw REST quote response, one variant per broker wire format
#[derive(Debug, Clone)]
pub enum QuotePayload {
    Angel(angel::AngelQuote),
    Zerodha(zerodha::KiteQuote),
}

/// Raw push packet, one variant per broker wire format
#[derive(Debug, Clone)]
pub enum WirePacket {
    Angel(angel::stream::AngelPacket),
    Zerodha(zerodha::stream::KitePacket),
}

impl WirePacket {
    /// Token carried by the packet
    pub fn token(&self) -> Option<Token> {
        match self {
            WirePacket::Angel(p) => Token::new(p.token),
            WirePacket::Zerodha(p) => Token::new(u64::from(p.instrument_token)),
        }
    }

    /// Exchange encoded in the packet, when the wire format carries one
    pub fn exchange(&self) -> Option<Exchange> {
        match self {
            WirePacket::Angel(p) => angel::stream::exchange_from_type(p.exchange_type),
            WirePacket::Zerodha(p) => zerodha::stream::exchange_from_token(p.instrument_token),
        }
    }

    /// Whether the packet carries an order book ladder
    pub fn has_depth(&self) -> bool {
        match self {
            WirePacket::Angel(p) => p.snap.as_ref().is_some_and(|s| !s.best_five.is_empty()),
            WirePacket::Zerodha(p) => !p.depth.is_empty(),
        }
    }
}

/// Broker session for an already authenticated user
#[derive(Clone)]
pub struct BrokerSession {
    pub broker_id: String,
    pub api_key: String,
    pub client_id: String,
    pub auth_token: String,
    pub feed_token: Option<String>,
}

impl fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession")
            .field("broker_id", &self.broker_id)
            .field("client_id", &self.client_id)
            .field("api_key", &"[REDACTED]")
            .field("auth_token", &"[REDACTED]")
            .field("feed_token", &self.feed_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Supported broker IDs
pub const SUPPORTED_BROKERS: [&str; 2] = ["angel", "zerodha"];

/// REST client and push transport for one broker session
pub struct BrokerAdapters {
    pub rest: Arc<dyn Broker>,
    pub transport: Arc<dyn PushTransport>,
}

impl BrokerAdapters {
    /// Build the adapters matching `session.broker_id`
    pub fn for_session(session: &BrokerSession) -> Result<Self> {
        match session.broker_id.as_str() {
            "angel" => Ok(Self {
                rest: Arc::new(angel::AngelBroker::new(session.clone())?),
                transport: Arc::new(angel::stream::AngelStream::new()),
            }),
            "zerodha" => Ok(Self {
                rest: Arc::new(zerodha::ZerodhaBroker::new(session.clone())?),
                transport: Arc::new(zerodha::stream::KiteStream::new()),
            }),
            other => Err(AppError::Broker(format!(
                "Unknown broker: {} (supported: {})",
                other,
                SUPPORTED_BROKERS.join(", ")
            ))),
        }
    }
}

/// Build a shared HTTP client the way every adapter does
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(AppError::from)
}
