//! Common broker types

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

/// Exchange / segment codes in OpenAlgo format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Exchange {
    Nse,
    Bse,
    Nfo,
    Bfo,
    Cds,
    Bcd,
    Mcx,
    NseIndex,
    BseIndex,
}

impl Exchange {
    pub const ALL: [Exchange; 9] = [
        Exchange::Nse,
        Exchange::Bse,
        Exchange::Nfo,
        Exchange::Bfo,
        Exchange::Cds,
        Exchange::Bcd,
        Exchange::Mcx,
        Exchange::NseIndex,
        Exchange::BseIndex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Nfo => "NFO",
            Exchange::Bfo => "BFO",
            Exchange::Cds => "CDS",
            Exchange::Bcd => "BCD",
            Exchange::Mcx => "MCX",
            Exchange::NseIndex => "NSE_INDEX",
            Exchange::BseIndex => "BSE_INDEX",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        Exchange::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| AppError::Validation(format!("Unknown exchange: {}", s)))
    }
}

/// Lookup key for an instrument: exchange plus normalized trading symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    exchange: Exchange,
    symbol: String,
}

impl InstrumentKey {
    /// Build a key, normalizing the symbol (trimmed, upper-case).
    pub fn new(exchange: Exchange, symbol: &str) -> Result<Self> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(AppError::Validation("Symbol must not be empty".to_string()));
        }
        Ok(Self { exchange, symbol })
    }

    /// Build a key from raw user input (`symbol`, `exchange` strings).
    pub fn parse(symbol: &str, exchange: &str) -> Result<Self> {
        Self::new(exchange.parse()?, symbol)
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

impl FromStr for InstrumentKey {
    type Err = AppError;

    /// Parse the `"<EXCHANGE>:<SYMBOL>"` form.
    fn from_str(s: &str) -> Result<Self> {
        let (exchange, symbol) = s
            .split_once(':')
            .ok_or_else(|| AppError::Validation(format!("Expected EXCHANGE:SYMBOL, got {}", s)))?;
        Self::parse(symbol, exchange)
    }
}

/// Broker-assigned numeric instrument identifier. Zero means "unresolved"
/// and is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Token(NonZeroU64);

impl Token {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Token)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl TryFrom<u64> for Token {
    type Error = String;

    fn try_from(value: u64) -> std::result::Result<Self, Self::Error> {
        Token::new(value).ok_or_else(|| "token must be non-zero".to_string())
    }
}

impl From<Token> for u64 {
    fn from(token: Token) -> u64 {
        token.get()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Token {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .ok()
            .and_then(Token::new)
            .ok_or_else(|| AppError::Validation(format!("Invalid token: {}", s)))
    }
}

/// Subscription type for market data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    Ltp,   // Last traded price only
    Quote, // LTP + OHLC + bid/ask
    Full,  // Quote + market depth
}

impl FromStr for SubscriptionMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ltp" => Ok(SubscriptionMode::Ltp),
            "quote" => Ok(SubscriptionMode::Quote),
            "full" | "depth" => Ok(SubscriptionMode::Full),
            other => Err(AppError::Validation(format!("Unknown subscription mode: {}", other))),
        }
    }
}

/// Where a tick came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickSource {
    Push,
    Poll,
}

/// Open/high/low/close for the session
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Depth level (bid/ask)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u64,
    pub orders: u32,
}

/// Order book ladder; index 0 is top of book on both sides
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub exchange: Exchange,
    pub token: Token,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub timestamp: i64,
}

/// Canonical market tick, identical regardless of the transport it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tick {
    pub symbol: String,
    pub exchange: Exchange,
    pub token: Token,
    pub mode: SubscriptionMode,
    pub ltp: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_qty: Option<u64>,
    pub ask_qty: Option<u64>,
    pub last_qty: Option<u64>,
    pub average_price: Option<f64>,
    pub volume: Option<u64>,
    pub open_interest: Option<u64>,
    pub ohlc: Option<Ohlc>,
    pub depth: Option<DepthSnapshot>,
    /// Source timestamp in epoch milliseconds
    pub timestamp: i64,
    pub source: TickSource,
}

/// Symbol data from master contract
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolData {
    pub symbol: String,
    pub token: u64,
    pub exchange: Exchange,
}
