//! Angel One broker adapter

pub mod stream;

use crate::brokers::de;
use crate::brokers::types::*;
use crate::brokers::{http_client, Broker, BrokerSession, QuotePayload};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

const BASE_URL: &str = "https://apiconnect.angelone.in";
const SCRIP_MASTER_URL: &str =
    "https://margincalculator.angelbroking.com/OpenAPI_File/files/OpenAPIScripMaster.json";

/// Quote item from `market/v1/quote` (FULL mode)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AngelQuote {
    pub exchange: String,
    pub trading_symbol: String,
    #[serde(deserialize_with = "de::string_or_u64")]
    pub symbol_token: u64,
    #[serde(default, deserialize_with = "de::optional_f64")]
    pub ltp: Option<f64>,
    #[serde(default, deserialize_with = "de::optional_f64")]
    pub open: Option<f64>,
    #[serde(default, deserialize_with = "de::optional_f64")]
    pub high: Option<f64>,
    #[serde(default, deserialize_with = "de::optional_f64")]
    pub low: Option<f64>,
    #[serde(default, deserialize_with = "de::optional_f64")]
    pub close: Option<f64>,
    #[serde(default, deserialize_with = "de::optional_u64")]
    pub last_trade_qty: Option<u64>,
    #[serde(default)]
    pub exch_feed_time: Option<String>,
    #[serde(default)]
    pub exch_trade_time: Option<String>,
    #[serde(default, deserialize_with = "de::optional_f64")]
    pub avg_price: Option<f64>,
    #[serde(default, deserialize_with = "de::optional_u64")]
    pub trade_volume: Option<u64>,
    #[serde(default, deserialize_with = "de::optional_u64")]
    pub opn_interest: Option<u64>,
    #[serde(default)]
    pub depth: Option<AngelDepth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AngelDepth {
    #[serde(default)]
    pub buy: Vec<AngelDepthLevel>,
    #[serde(default)]
    pub sell: Vec<AngelDepthLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AngelDepthLevel {
    #[serde(default, deserialize_with = "de::optional_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "de::optional_u64")]
    pub quantity: Option<u64>,
    #[serde(default, deserialize_with = "de::optional_u64")]
    pub orders: Option<u64>,
}

/// Row of the public scrip master file
#[derive(Debug, Clone, Deserialize)]
struct ScripRow {
    #[serde(deserialize_with = "de::string_or_u64")]
    token: u64,
    symbol: String,
    #[serde(default)]
    instrumenttype: String,
    exch_seg: String,
}

/// Angel One broker implementation
pub struct AngelBroker {
    client: Client,
    session: BrokerSession,
}

impl AngelBroker {
    pub fn new(session: BrokerSession) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            session,
        })
    }

    fn get_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("X-UserType", HeaderValue::from_static("USER"));
        headers.insert("X-SourceID", HeaderValue::from_static("WEB"));
        headers.insert("X-ClientLocalIP", HeaderValue::from_static("127.0.0.1"));
        headers.insert("X-ClientPublicIP", HeaderValue::from_static("127.0.0.1"));
        headers.insert("X-MACAddress", HeaderValue::from_static("00:00:00:00:00:00"));
        headers.insert("X-PrivateKey", header_value(&self.session.api_key)?);
        headers.insert(
            "Authorization",
            header_value(&format!("Bearer {}", self.session.auth_token))?,
        );
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Validation(format!("Invalid header value: {}", e)))
}

/// Angel REST exchange segment for an OpenAlgo exchange
fn rest_segment(exchange: Exchange) -> &'static str {
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

/// Map one scrip master row into OpenAlgo form, if it belongs to `exchange`
fn map_scrip_row(row: ScripRow, exchange: Exchange) -> Option<SymbolData> {
    let is_index = row.instrumenttype == "AMXIDX";
    let row_exchange = match (row.exch_seg.as_str(), is_index) {
        ("NSE", true) => Exchange::NseIndex,
        ("BSE", true) => Exchange::BseIndex,
        (seg, _) => seg.parse().ok()?,
    };
    if row_exchange != exchange {
        return None;
    }

    let symbol = match exchange {
        Exchange::Nse | Exchange::Bse => ["-EQ", "-BE", "-MF", "-SG"]
            .iter()
            .find_map(|suffix| row.symbol.strip_suffix(suffix))
            .unwrap_or(row.symbol.as_str())
            .to_string(),
        _ => row.symbol,
    };

    Some(SymbolData {
        symbol,
        token: row.token,
        exchange,
    })
}

#[async_trait]
impl Broker for AngelBroker {
    fn id(&self) -> &'static str {
        "angel"
    }

    fn name(&self) -> &'static str {
        "Angel One"
    }

    async fn get_quote(&self, exchange: Exchange, token: Token) -> Result<QuotePayload> {
        let mut exchange_tokens = serde_json::Map::new();
        exchange_tokens.insert(rest_segment(exchange).to_string(), json!([token.to_string()]));
        let request = json!({ "mode": "FULL", "exchangeTokens": exchange_tokens });

        let response = self
            .client
            .post(format!("{}/rest/secure/angelbroking/market/v1/quote/", BASE_URL))
            .headers(self.get_headers()?)
            .json(&request)
            .send()
            .await?;

        #[derive(Deserialize)]
        struct QuoteResponse {
            status: bool,
            message: String,
            data: Option<QuoteData>,
        }

        #[derive(Deserialize)]
        struct QuoteData {
            #[serde(default)]
            fetched: Vec<AngelQuote>,
        }

        let result: QuoteResponse = response.json().await?;

        if !result.status {
            return Err(AppError::Broker(result.message));
        }

        result
            .data
            .and_then(|d| d.fetched.into_iter().next())
            .map(QuotePayload::Angel)
            .ok_or_else(|| AppError::Broker(format!("No quote returned for {}:{}", exchange, token)))
    }

    async fn download_master_contract(&self, exchange: Exchange) -> Result<Vec<SymbolData>> {
        let rows: Vec<ScripRow> = self
            .client
            .get(SCRIP_MASTER_URL)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let symbols: Vec<SymbolData> = rows
            .into_iter()
            .filter_map(|row| map_scrip_row(row, exchange))
            .collect();

        tracing::info!("Downloaded {} {} symbols from Angel One", symbols.len(), exchange);
        Ok(symbols)
    }
}
