//! Angel One SmartStream (v2) push transport
//!
//! Little-endian binary ticks. Packet layout by subscription mode:
//!
//! | bytes     | field                                     | mode    |
//! |-----------|-------------------------------------------|---------|
//! | 0         | subscription mode                         | all     |
//! | 1         | exchange type                             | all     |
//! | 2..27     | token (NUL padded ASCII)                  | all     |
//! | 27..35    | sequence number                           | all     |
//! | 35..43    | exchange timestamp (epoch ms)             | all     |
//! | 43..51    | last traded price (paise)                 | all     |
//! | 51..123   | qty, avg, volume, buy/sell qty, OHLC      | quote+  |
//! | 123..147  | last trade time, OI, OI change            | snap    |
//! | 147..347  | best five buy/sell, 10 x 20 bytes         | snap    |
//! | 347..379  | circuits and 52 week range                | snap    |

use crate::brokers::types::{Exchange, SubscriptionMode};
use crate::brokers::{BrokerSession, WirePacket};
use crate::error::{AppError, Result};
use crate::feed::handlers;
use crate::feed::registry::Subscription;
use crate::feed::transport::{PushTransport, TransportEvent, TransportStatus};
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

const WS_URL: &str = "wss://smartapisocket.angelone.in/smart-stream";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub const LTP_PACKET_LEN: usize = 51;
pub const QUOTE_PACKET_LEN: usize = 123;
pub const SNAP_QUOTE_PACKET_LEN: usize = 379;

const ACTION_SUBSCRIBE: u8 = 1;
const ACTION_UNSUBSCRIBE: u8 = 0;

/// Quote block present from mode 2 upwards. Prices in paise.
#[derive(Debug, Clone, PartialEq)]
pub struct AngelQuoteBlock {
    pub last_traded_qty: i64,
    pub avg_traded_price: i64,
    pub volume: i64,
    pub total_buy_qty: f64,
    pub total_sell_qty: f64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
}

/// One of the best-five entries in a snap quote
#[derive(Debug, Clone, PartialEq)]
pub struct AngelDepthEntry {
    pub is_buy: bool,
    pub quantity: i64,
    pub price: i64,
    pub orders: i16,
}

/// Snap quote block (mode 3)
#[derive(Debug, Clone, PartialEq)]
pub struct AngelSnapBlock {
    pub last_traded_timestamp: i64,
    pub open_interest: i64,
    pub best_five: Vec<AngelDepthEntry>,
}

/// Decoded SmartStream packet
#[derive(Debug, Clone, PartialEq)]
pub struct AngelPacket {
    pub mode: u8,
    pub exchange_type: u8,
    pub token: u64,
    pub sequence: i64,
    pub exchange_timestamp: i64,
    pub ltp: i64,
    pub quote: Option<AngelQuoteBlock>,
    pub snap: Option<AngelSnapBlock>,
}

/// SmartStream exchange type for an OpenAlgo exchange
pub fn exchange_type(exchange: Exchange) -> Option<u8> {
    match exchange {
        Exchange::Nse | Exchange::NseIndex => Some(1),
        Exchange::Nfo => Some(2),
        Exchange::Bse | Exchange::BseIndex => Some(3),
        Exchange::Bfo => Some(4),
        Exchange::Mcx => Some(5),
        Exchange::Cds => Some(13),
        Exchange::Bcd => None,
    }
}

pub fn exchange_from_type(exchange_type: u8) -> Option<Exchange> {
    match exchange_type {
        1 => Some(Exchange::Nse),
        2 => Some(Exchange::Nfo),
        3 => Some(Exchange::Bse),
        4 => Some(Exchange::Bfo),
        5 => Some(Exchange::Mcx),
        13 => Some(Exchange::Cds),
        _ => None,
    }
}

fn mode_code(mode: SubscriptionMode) -> u8 {
    match mode {
        SubscriptionMode::Ltp => 1,
        SubscriptionMode::Quote => 2,
        SubscriptionMode::Full => 3,
    }
}

/// Decode one binary frame. Returns `None` for truncated or unknown frames.
pub fn parse_packet(data: &[u8]) -> Option<AngelPacket> {
    if data.len() < LTP_PACKET_LEN {
        return None;
    }

    let mode = data[0];
    let token_bytes = &data[2..27];
    let token_end = token_bytes.iter().position(|b| *b == 0).unwrap_or(token_bytes.len());
    let token = std::str::from_utf8(&token_bytes[..token_end]).ok()?.trim().parse().ok()?;

    let quote = if mode >= 2 {
        if data.len() < QUOTE_PACKET_LEN {
            return None;
        }
        Some(AngelQuoteBlock {
            last_traded_qty: LittleEndian::read_i64(&data[51..59]),
            avg_traded_price: LittleEndian::read_i64(&data[59..67]),
            volume: LittleEndian::read_i64(&data[67..75]),
            total_buy_qty: LittleEndian::read_f64(&data[75..83]),
            total_sell_qty: LittleEndian::read_f64(&data[83..91]),
            open: LittleEndian::read_i64(&data[91..99]),
            high: LittleEndian::read_i64(&data[99..107]),
            low: LittleEndian::read_i64(&data[107..115]),
            close: LittleEndian::read_i64(&data[115..123]),
        })
    } else {
        None
    };

    let snap = if mode == 3 {
        if data.len() < SNAP_QUOTE_PACKET_LEN {
            return None;
        }
        let best_five = data[147..347]
            .chunks_exact(20)
            .map(|entry| AngelDepthEntry {
                is_buy: LittleEndian::read_i16(&entry[0..2]) == 1,
                quantity: LittleEndian::read_i64(&entry[2..10]),
                price: LittleEndian::read_i64(&entry[10..18]),
                orders: LittleEndian::read_i16(&entry[18..20]),
            })
            .collect();
        Some(AngelSnapBlock {
            last_traded_timestamp: LittleEndian::read_i64(&data[123..131]),
            open_interest: LittleEndian::read_i64(&data[131..139]),
            best_five,
        })
    } else {
        None
    };

    Some(AngelPacket {
        mode,
        exchange_type: data[1],
        token,
        sequence: LittleEndian::read_i64(&data[27..35]),
        exchange_timestamp: LittleEndian::read_i64(&data[35..43]),
        ltp: LittleEndian::read_i64(&data[43..51]),
        quote,
        snap,
    })
}

/// Build a subscribe (action 1) or unsubscribe (action 0) request
fn request_message(action: u8, subscription: &Subscription) -> Result<String> {
    let exchange = subscription.key.exchange();
    let exchange_type = exchange_type(exchange).ok_or_else(|| {
        AppError::Validation(format!("{} is not available on SmartStream", exchange))
    })?;

    let correlation_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(10).collect();
    let message = json!({
        "correlationID": correlation_id,
        "action": action,
        "params": {
            "mode": mode_code(subscription.mode),
            "tokenList": [{
                "exchangeType": exchange_type,
                "tokens": [subscription.token.to_string()],
            }],
        },
    });
    Ok(message.to_string())
}

/// Commands to send to the socket task
enum StreamCommand {
    Send(String),
    Disconnect,
}

/// SmartStream transport; one socket task per successful `connect`
#[derive(Default)]
pub struct AngelStream {
    sender: RwLock<Option<mpsc::Sender<StreamCommand>>>,
}

impl AngelStream {
    pub fn new() -> Self {
        Self::default()
    }

    async fn send(&self, text: String) -> Result<()> {
        let sender = self.sender.read().clone();
        let tx = sender.ok_or_else(|| AppError::Transport("SmartStream not connected".to_string()))?;
        tx.send(StreamCommand::Send(text))
            .await
            .map_err(|_| AppError::Transport("SmartStream socket task has stopped".to_string()))
    }
}

#[async_trait]
impl PushTransport for AngelStream {
    fn broker_id(&self) -> &'static str {
        "angel"
    }

    async fn connect(&self, session: &BrokerSession, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let feed_token = session
            .feed_token
            .as_deref()
            .ok_or_else(|| AppError::Validation("Feed token is required for SmartStream".to_string()))?;

        let mut request = WS_URL.into_client_request()?;
        let headers = request.headers_mut();
        for (name, value) in [
            ("Authorization", session.auth_token.as_str()),
            ("x-api-key", session.api_key.as_str()),
            ("x-client-code", session.client_id.as_str()),
            ("x-feed-token", feed_token),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| AppError::Validation(format!("Invalid {} header: {}", name, e)))?;
            headers.insert(name, value);
        }

        let (ws_stream, _) = connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<StreamCommand>(100);
        *self.sender.write() = Some(tx);

        let _ = events.send(TransportEvent::Status(TransportStatus::Connected)).await;
        handlers::on_connected(self.broker_id());

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;

            let status = loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let Some(packet) = parse_packet(&data) else {
                                debug!("Ignoring {} byte SmartStream frame", data.len());
                                continue;
                            };
                            let has_depth = packet.snap.as_ref().is_some_and(|s| !s.best_five.is_empty());
                            if has_depth
                                && events.send(TransportEvent::Depth(WirePacket::Angel(packet.clone()))).await.is_err()
                            {
                                break None;
                            }
                            if events.send(TransportEvent::Tick(WirePacket::Angel(packet))).await.is_err() {
                                break None;
                            }
                        }
                        Some(Ok(Message::Text(text))) if text == "pong" => {}
                        Some(Ok(Message::Text(text))) => {
                            debug!("SmartStream message: {}", text);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break Some(TransportStatus::Disconnected(frame.map(|f| f.reason.to_string())));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(TransportStatus::Error(e.to_string())),
                        None => break Some(TransportStatus::Disconnected(None)),
                    },
                    cmd = rx.recv() => match cmd {
                        Some(StreamCommand::Send(text)) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                break Some(TransportStatus::Error(e.to_string()));
                            }
                        }
                        Some(StreamCommand::Disconnect) | None => {
                            let _ = write.close().await;
                            break None;
                        }
                    },
                    _ = heartbeat.tick() => {
                        if let Err(e) = write.send(Message::Text("ping".to_string())).await {
                            warn!("SmartStream heartbeat failed: {}", e);
                            break Some(TransportStatus::Error(e.to_string()));
                        }
                    }
                }
            };

            // Only unsolicited endings are reported; a requested disconnect is silent.
            if let Some(status) = status {
                let _ = events.send(TransportEvent::Status(status)).await;
            }
        });

        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        self.send(request_message(ACTION_SUBSCRIBE, subscription)?).await
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.send(request_message(ACTION_UNSUBSCRIBE, subscription)?).await
    }

    async fn disconnect(&self) {
        let sender = self.sender.write().take();
        if let Some(tx) = sender {
            let _ = tx.send(StreamCommand::Disconnect).await;
        }
    }
}
