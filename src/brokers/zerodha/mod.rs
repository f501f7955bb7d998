//! Zerodha Kite broker adapter

pub mod stream;

use crate::brokers::types::*;
use crate::brokers::{http_client, Broker, BrokerSession, QuotePayload};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

const BASE_URL: &str = "https://api.kite.trade";

/// Quote object from `GET /quote`
#[derive(Debug, Clone, Deserialize)]
pub struct KiteQuote {
    pub instrument_token: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub last_trade_time: Option<String>,
    pub last_price: f64,
    #[serde(default)]
    pub last_quantity: Option<u64>,
    #[serde(default)]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default)]
    pub buy_quantity: Option<u64>,
    #[serde(default)]
    pub sell_quantity: Option<u64>,
    #[serde(default)]
    pub oi: Option<f64>,
    #[serde(default)]
    pub ohlc: Option<KiteOhlc>,
    #[serde(default)]
    pub depth: Option<KiteDepth>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KiteOhlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KiteDepth {
    #[serde(default)]
    pub buy: Vec<KiteDepthLevel>,
    #[serde(default)]
    pub sell: Vec<KiteDepthLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KiteDepthLevel {
    pub price: f64,
    pub quantity: u64,
    #[serde(default)]
    pub orders: u32,
}

/// Zerodha Kite broker implementation
pub struct ZerodhaBroker {
    client: Client,
    session: BrokerSession,
}

impl ZerodhaBroker {
    pub fn new(session: BrokerSession) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            session,
        })
    }

    fn get_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Kite-Version", HeaderValue::from_static("3"));
        let auth = format!("token {}:{}", self.session.api_key, self.session.auth_token);
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&auth)
                .map_err(|e| AppError::Validation(format!("Invalid access token: {}", e)))?,
        );
        Ok(headers)
    }
}

/// Kite exchange name holding the instruments of an OpenAlgo exchange
fn kite_exchange(exchange: Exchange) -> &'static str {
    match exchange {
        Exchange::Nse | Exchange::NseIndex => "NSE",
        Exchange::Bse | Exchange::BseIndex => "BSE",
        Exchange::Nfo => "NFO",
        Exchange::Bfo => "BFO",
        Exchange::Cds => "CDS",
        Exchange::Bcd => "BCD",
        Exchange::Mcx => "MCX",
    }
}

/// Split one CSV line, honouring double-quoted fields
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse the instruments CSV, keeping rows that belong to `exchange`.
///
/// Columns: instrument_token, exchange_token, tradingsymbol, name,
/// last_price, expiry, strike, tick_size, lot_size, instrument_type,
/// segment, exchange
fn parse_instruments_csv(csv_text: &str, exchange: Exchange) -> Vec<SymbolData> {
    let wants_index = matches!(exchange, Exchange::NseIndex | Exchange::BseIndex);

    csv_text
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_csv_line(line);
            if fields.len() < 12 {
                return None;
            }
            let is_index = fields[10] == "INDICES";
            if is_index != wants_index {
                return None;
            }
            let token = fields[0].trim().parse::<u64>().ok()?;
            Some(SymbolData {
                symbol: fields[2].trim().to_string(),
                token,
                exchange,
            })
        })
        .collect()
}

#[async_trait]
impl Broker for ZerodhaBroker {
    fn id(&self) -> &'static str {
        "zerodha"
    }

    fn name(&self) -> &'static str {
        "Zerodha"
    }

    async fn get_quote(&self, exchange: Exchange, token: Token) -> Result<QuotePayload> {
        let response = self
            .client
            .get(format!("{}/quote", BASE_URL))
            .query(&[("i", token.to_string())])
            .headers(self.get_headers()?)
            .send()
            .await?;

        #[derive(Deserialize)]
        struct QuoteResponse {
            status: String,
            #[serde(default)]
            data: HashMap<String, KiteQuote>,
            message: Option<String>,
        }

        let result: QuoteResponse = response.json().await?;

        if result.status != "success" {
            return Err(AppError::Broker(
                result.message.unwrap_or_else(|| "Quote request failed".to_string()),
            ));
        }

        result
            .data
            .into_values()
            .next()
            .map(QuotePayload::Zerodha)
            .ok_or_else(|| AppError::Broker(format!("No quote returned for {}:{}", exchange, token)))
    }

    async fn download_master_contract(&self, exchange: Exchange) -> Result<Vec<SymbolData>> {
        let csv_text = self
            .client
            .get(format!("{}/instruments/{}", BASE_URL, kite_exchange(exchange)))
            .headers(self.get_headers()?)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let symbols = parse_instruments_csv(&csv_text, exchange);
        tracing::info!("Downloaded {} {} symbols from Zerodha", symbols.len(), exchange);
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
738561,2885,RELIANCE,\"RELIANCE INDUSTRIES, LTD\",0,,0,0.05,1,EQ,NSE,NSE
256265,1001,NIFTY 50,,0,,0,0,0,EQ,INDICES,NSE
0,0,BROKEN,,0,,0,0,0,EQ,NSE,NSE
short,row
";

    #[test]
    fn test_quoted_commas_kept_in_field() {
        let fields = split_csv_line("1,\"A, B\",C");
        assert_eq!(fields, vec!["1", "A, B", "C"]);
    }

    #[test]
    fn test_parse_equities() {
        let symbols = parse_instruments_csv(CSV, Exchange::Nse);
        // the zero token row is kept here and dropped by the resolver import
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].symbol, "RELIANCE");
        assert_eq!(symbols[0].token, 738561);
    }

    #[test]
    fn test_parse_indices() {
        let symbols = parse_instruments_csv(CSV, Exchange::NseIndex);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].symbol, "NIFTY 50");
        assert_eq!(symbols[0].exchange, Exchange::NseIndex);
    }

    #[test]
    fn test_quote_response_parses() {
        let quote: KiteQuote = serde_json::from_value(serde_json::json!({
            "instrument_token": 408065,
            "timestamp": "2021-06-08 15:45:56",
            "last_price": 1412.95,
            "last_quantity": 5,
            "volume": 7360198,
            "ohlc": {"open": 1396, "high": 1421.75, "low": 1395.55, "close": 1389.65},
            "depth": {"buy": [{"price": 1412.9, "quantity": 50, "orders": 1}], "sell": []}
        }))
        .unwrap();
        assert_eq!(quote.instrument_token, 408065);
        assert_eq!(quote.ohlc.unwrap().open, 1396.0);
        assert_eq!(quote.depth.unwrap().buy.len(), 1);
    }
}
