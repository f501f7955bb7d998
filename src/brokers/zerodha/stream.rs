//! Zerodha Kite Ticker push transport
//!
//! Big-endian binary frames. A frame starts with a u16 packet count, each
//! packet prefixed by its u16 length. Packet length identifies the mode:
//! 8 (ltp), 28/32 (index quote/full), 44 (quote), 184 (full with depth).

use crate::brokers::types::{Exchange, SubscriptionMode};
use crate::brokers::{BrokerSession, WirePacket};
use crate::error::{AppError, Result};
use crate::feed::handlers;
use crate::feed::registry::Subscription;
use crate::feed::transport::{PushTransport, TransportEvent, TransportStatus};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

const WS_URL: &str = "wss://ws.kite.trade";

const LTP_PACKET_LEN: usize = 8;
const INDEX_QUOTE_PACKET_LEN: usize = 28;
const INDEX_FULL_PACKET_LEN: usize = 32;
const QUOTE_PACKET_LEN: usize = 44;
const FULL_PACKET_LEN: usize = 184;

const SEGMENT_INDICES: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KiteOhlcBlock {
    pub open: i32,
    pub high: i32,
    pub low: i32,
    pub close: i32,
}

/// One market depth entry from a full packet
#[derive(Debug, Clone, PartialEq)]
pub struct KiteDepthEntry {
    pub is_buy: bool,
    pub quantity: u32,
    pub price: i32,
    pub orders: u16,
}

/// Decoded ticker packet. Prices are integers scaled by [`price_divisor`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KitePacket {
    pub instrument_token: u32,
    pub ltp: i32,
    pub last_quantity: Option<u32>,
    pub average_price: Option<i32>,
    pub volume: Option<u32>,
    pub buy_quantity: Option<u32>,
    pub sell_quantity: Option<u32>,
    pub ohlc: Option<KiteOhlcBlock>,
    pub last_trade_time: Option<u32>,
    pub oi: Option<u32>,
    /// Exchange timestamp, epoch seconds
    pub exchange_timestamp: Option<u32>,
    pub depth: Vec<KiteDepthEntry>,
}

/// Exchange segment encoded in the low byte of an instrument token
pub fn exchange_from_token(instrument_token: u32) -> Option<Exchange> {
    match instrument_token & 0xff {
        1 => Some(Exchange::Nse),
        2 => Some(Exchange::Nfo),
        3 => Some(Exchange::Cds),
        4 => Some(Exchange::Bse),
        5 => Some(Exchange::Bfo),
        6 => Some(Exchange::Bcd),
        7 => Some(Exchange::Mcx),
        SEGMENT_INDICES => Some(Exchange::NseIndex),
        _ => None,
    }
}

/// Integer price divisor for an instrument's segment
pub fn price_divisor(instrument_token: u32) -> f64 {
    match instrument_token & 0xff {
        3 => 10_000_000.0,
        6 => 10_000.0,
        _ => 100.0,
    }
}

fn read_ohlc(data: &[u8]) -> KiteOhlcBlock {
    KiteOhlcBlock {
        open: BigEndian::read_i32(&data[0..4]),
        high: BigEndian::read_i32(&data[4..8]),
        low: BigEndian::read_i32(&data[8..12]),
        close: BigEndian::read_i32(&data[12..16]),
    }
}

/// Decode a single packet. Unknown lengths yield `None`.
pub fn parse_packet(data: &[u8]) -> Option<KitePacket> {
    let len = data.len();
    if !matches!(
        len,
        LTP_PACKET_LEN | INDEX_QUOTE_PACKET_LEN | INDEX_FULL_PACKET_LEN | QUOTE_PACKET_LEN | FULL_PACKET_LEN
    ) {
        return None;
    }

    let mut packet = KitePacket {
        instrument_token: BigEndian::read_u32(&data[0..4]),
        ltp: BigEndian::read_i32(&data[4..8]),
        ..Default::default()
    };

    if len == LTP_PACKET_LEN {
        return Some(packet);
    }

    if packet.instrument_token & 0xff == SEGMENT_INDICES {
        if len != INDEX_QUOTE_PACKET_LEN && len != INDEX_FULL_PACKET_LEN {
            return None;
        }
        // index packets order the block as high, low, open, close
        packet.ohlc = Some(KiteOhlcBlock {
            high: BigEndian::read_i32(&data[8..12]),
            low: BigEndian::read_i32(&data[12..16]),
            open: BigEndian::read_i32(&data[16..20]),
            close: BigEndian::read_i32(&data[20..24]),
        });
        if len == INDEX_FULL_PACKET_LEN {
            packet.exchange_timestamp = Some(BigEndian::read_u32(&data[28..32]));
        }
        return Some(packet);
    }

    if len != QUOTE_PACKET_LEN && len != FULL_PACKET_LEN {
        return None;
    }

    packet.last_quantity = Some(BigEndian::read_u32(&data[8..12]));
    packet.average_price = Some(BigEndian::read_i32(&data[12..16]));
    packet.volume = Some(BigEndian::read_u32(&data[16..20]));
    packet.buy_quantity = Some(BigEndian::read_u32(&data[20..24]));
    packet.sell_quantity = Some(BigEndian::read_u32(&data[24..28]));
    packet.ohlc = Some(read_ohlc(&data[28..44]));

    if len == FULL_PACKET_LEN {
        packet.last_trade_time = Some(BigEndian::read_u32(&data[44..48]));
        packet.oi = Some(BigEndian::read_u32(&data[48..52]));
        packet.exchange_timestamp = Some(BigEndian::read_u32(&data[60..64]));
        packet.depth = data[64..184]
            .chunks_exact(12)
            .enumerate()
            .map(|(i, entry)| KiteDepthEntry {
                is_buy: i < 5,
                quantity: BigEndian::read_u32(&entry[0..4]),
                price: BigEndian::read_i32(&entry[4..8]),
                orders: BigEndian::read_u16(&entry[8..10]),
            })
            .collect();
    }

    Some(packet)
}

/// Split a binary frame into packets. A 1 byte frame is a heartbeat.
pub fn parse_frame(data: &[u8]) -> Vec<KitePacket> {
    if data.len() < 2 {
        return Vec::new();
    }

    let count = BigEndian::read_u16(&data[0..2]) as usize;
    let mut packets = Vec::with_capacity(count);
    let mut offset = 2;

    for _ in 0..count {
        if offset + 2 > data.len() {
            break;
        }
        let len = BigEndian::read_u16(&data[offset..offset + 2]) as usize;
        offset += 2;
        if offset + len > data.len() {
            debug!("Truncated Kite frame: packet of {} bytes at {}", len, offset);
            break;
        }
        match parse_packet(&data[offset..offset + len]) {
            Some(packet) => packets.push(packet),
            None => debug!("Ignoring {} byte Kite packet", len),
        }
        offset += len;
    }

    packets
}

fn mode_name(mode: SubscriptionMode) -> &'static str {
    match mode {
        SubscriptionMode::Ltp => "ltp",
        SubscriptionMode::Quote => "quote",
        SubscriptionMode::Full => "full",
    }
}

fn instrument_token(subscription: &Subscription) -> Result<u32> {
    u32::try_from(subscription.token.get()).map_err(|_| {
        AppError::Validation(format!(
            "Token {} for {} is out of range for Kite",
            subscription.token, subscription.key
        ))
    })
}

/// Subscribe is two commands: add the token, then set its mode
fn subscribe_messages(subscription: &Subscription) -> Result<[String; 2]> {
    let token = instrument_token(subscription)?;
    Ok([
        json!({ "a": "subscribe", "v": [token] }).to_string(),
        json!({ "a": "mode", "v": [mode_name(subscription.mode), [token]] }).to_string(),
    ])
}

fn unsubscribe_message(subscription: &Subscription) -> Result<String> {
    let token = instrument_token(subscription)?;
    Ok(json!({ "a": "unsubscribe", "v": [token] }).to_string())
}

fn ticker_url(session: &BrokerSession) -> Result<Url> {
    Url::parse_with_params(
        WS_URL,
        &[
            ("api_key", session.api_key.as_str()),
            ("access_token", session.auth_token.as_str()),
        ],
    )
    .map_err(|e| AppError::Config(format!("Invalid Kite ticker URL: {}", e)))
}

enum StreamCommand {
    Send(String),
    Disconnect,
}

/// Kite Ticker transport
#[derive(Default)]
pub struct KiteStream {
    sender: RwLock<Option<mpsc::Sender<StreamCommand>>>,
}

impl KiteStream {
    pub fn new() -> Self {
        Self::default()
    }

    async fn send(&self, text: String) -> Result<()> {
        let sender = self.sender.read().clone();
        let tx = sender.ok_or_else(|| AppError::Transport("Kite ticker not connected".to_string()))?;
        tx.send(StreamCommand::Send(text))
            .await
            .map_err(|_| AppError::Transport("Kite ticker socket task has stopped".to_string()))
    }
}

#[async_trait]
impl PushTransport for KiteStream {
    fn broker_id(&self) -> &'static str {
        "zerodha"
    }

    async fn connect(&self, session: &BrokerSession, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let request = ticker_url(session)?.as_str().into_client_request()?;
        let (ws_stream, _) = connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<StreamCommand>(100);
        *self.sender.write() = Some(tx);

        let _ = events.send(TransportEvent::Status(TransportStatus::Connected)).await;
        handlers::on_connected(self.broker_id());

        tokio::spawn(async move {
            let status = 'socket: loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            for packet in parse_frame(&data) {
                                if !packet.depth.is_empty()
                                    && events.send(TransportEvent::Depth(WirePacket::Zerodha(packet.clone()))).await.is_err()
                                {
                                    break 'socket None;
                                }
                                if events.send(TransportEvent::Tick(WirePacket::Zerodha(packet))).await.is_err() {
                                    break 'socket None;
                                }
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<serde_json::Value>(&text) {
                                Ok(value) if value["type"] == "error" => {
                                    warn!("Kite ticker error: {}", value["data"]);
                                }
                                _ => debug!("Kite ticker message: {}", text),
                            }
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
                }
            };

            if let Some(status) = status {
                let _ = events.send(TransportEvent::Status(status)).await;
            }
        });

        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        for message in subscribe_messages(subscription)? {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.send(unsubscribe_message(subscription)?).await
    }

    async fn disconnect(&self) {
        let sender = self.sender.write().take();
        if let Some(tx) = sender {
            let _ = tx.send(StreamCommand::Disconnect).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::brokers::types::{InstrumentKey, Token};

    /// NSE segment token for RELIANCE
    pub(crate) const RELIANCE_TOKEN: u32 = 738561;

    /// Encode a full (184 byte) packet
    pub(crate) fn encode_full(packet: &KitePacket) -> Vec<u8> {
        let mut data = vec![0u8; FULL_PACKET_LEN];
        BigEndian::write_u32(&mut data[0..4], packet.instrument_token);
        BigEndian::write_i32(&mut data[4..8], packet.ltp);
        BigEndian::write_u32(&mut data[8..12], packet.last_quantity.unwrap_or(0));
        BigEndian::write_i32(&mut data[12..16], packet.average_price.unwrap_or(0));
        BigEndian::write_u32(&mut data[16..20], packet.volume.unwrap_or(0));
        BigEndian::write_u32(&mut data[20..24], packet.buy_quantity.unwrap_or(0));
        BigEndian::write_u32(&mut data[24..28], packet.sell_quantity.unwrap_or(0));
        if let Some(ohlc) = packet.ohlc {
            BigEndian::write_i32(&mut data[28..32], ohlc.open);
            BigEndian::write_i32(&mut data[32..36], ohlc.high);
            BigEndian::write_i32(&mut data[36..40], ohlc.low);
            BigEndian::write_i32(&mut data[40..44], ohlc.close);
        }
        BigEndian::write_u32(&mut data[44..48], packet.last_trade_time.unwrap_or(0));
        BigEndian::write_u32(&mut data[48..52], packet.oi.unwrap_or(0));
        BigEndian::write_u32(&mut data[60..64], packet.exchange_timestamp.unwrap_or(0));
        for (i, entry) in packet.depth.iter().enumerate() {
            let at = 64 + i * 12;
            BigEndian::write_u32(&mut data[at..at + 4], entry.quantity);
            BigEndian::write_i32(&mut data[at + 4..at + 8], entry.price);
            BigEndian::write_u16(&mut data[at + 8..at + 10], entry.orders);
        }
        data
    }

    pub(crate) fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut data = vec![0u8; 2];
        BigEndian::write_u16(&mut data[0..2], packets.len() as u16);
        for packet in packets {
            let mut len = [0u8; 2];
            BigEndian::write_u16(&mut len, packet.len() as u16);
            data.extend_from_slice(&len);
            data.extend_from_slice(packet);
        }
        data
    }

    pub(crate) fn full_packet() -> KitePacket {
        let depth = (0..10)
            .map(|i| KiteDepthEntry {
                is_buy: i < 5,
                quantity: if i < 5 { 100 + i } else { 200 + i },
                price: if i < 5 { 290_000 - i as i32 * 5 } else { 290_100 + (i as i32 - 5) * 5 },
                orders: 2,
            })
            .collect();

        KitePacket {
            instrument_token: RELIANCE_TOKEN,
            ltp: 290_075,
            last_quantity: Some(10),
            average_price: Some(290_050),
            volume: Some(1_500_000),
            buy_quantity: Some(25_000),
            sell_quantity: Some(30_000),
            ohlc: Some(KiteOhlcBlock {
                open: 288_000,
                high: 292_500,
                low: 287_000,
                close: 289_000,
            }),
            last_trade_time: Some(1_700_000_000),
            oi: Some(0),
            exchange_timestamp: Some(1_700_000_000),
            depth,
        }
    }

    #[test]
    fn test_parse_full_packet() {
        let packet = full_packet();
        assert_eq!(parse_packet(&encode_full(&packet)), Some(packet));
    }

    #[test]
    fn test_parse_frame_with_ltp_and_full() {
        let mut ltp = vec![0u8; LTP_PACKET_LEN];
        BigEndian::write_u32(&mut ltp[0..4], 408065);
        BigEndian::write_i32(&mut ltp[4..8], 141_295);

        let packets = parse_frame(&frame(&[ltp, encode_full(&full_packet())]));
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].instrument_token, 408065);
        assert_eq!(packets[0].ltp, 141_295);
        assert!(packets[0].depth.is_empty());
        assert_eq!(packets[1].depth.len(), 10);
    }

    #[test]
    fn test_heartbeat_and_truncated_frames() {
        assert!(parse_frame(&[0]).is_empty());
        let mut data = frame(&[encode_full(&full_packet())]);
        data.truncate(100);
        assert!(parse_frame(&data).is_empty());
    }

    #[test]
    fn test_index_packet_ohlc_order() {
        let mut data = vec![0u8; INDEX_FULL_PACKET_LEN];
        BigEndian::write_u32(&mut data[0..4], 256265);
        BigEndian::write_i32(&mut data[4..8], 2_450_000);
        BigEndian::write_i32(&mut data[8..12], 2_460_000);
        BigEndian::write_i32(&mut data[12..16], 2_440_000);
        BigEndian::write_i32(&mut data[16..20], 2_445_000);
        BigEndian::write_i32(&mut data[20..24], 2_441_000);
        BigEndian::write_u32(&mut data[28..32], 1_700_000_000);

        let packet = parse_packet(&data).unwrap();
        let ohlc = packet.ohlc.unwrap();
        assert_eq!(ohlc.open, 2_445_000);
        assert_eq!(ohlc.high, 2_460_000);
        assert_eq!(packet.exchange_timestamp, Some(1_700_000_000));
        assert_eq!(exchange_from_token(256265), Some(Exchange::NseIndex));
    }

    #[test]
    fn test_segment_divisors() {
        assert_eq!(price_divisor(RELIANCE_TOKEN), 100.0);
        assert_eq!(price_divisor(0x1203), 10_000_000.0);
        assert_eq!(price_divisor(0x1206), 10_000.0);
    }

    #[test]
    fn test_command_messages() {
        let subscription = Subscription {
            key: InstrumentKey::new(Exchange::Nse, "RELIANCE").unwrap(),
            token: Token::new(u64::from(RELIANCE_TOKEN)).unwrap(),
            mode: SubscriptionMode::Full,
        };
        let [subscribe, mode] = subscribe_messages(&subscription).unwrap();
        let subscribe: serde_json::Value = serde_json::from_str(&subscribe).unwrap();
        let mode: serde_json::Value = serde_json::from_str(&mode).unwrap();
        assert_eq!(subscribe["a"], "subscribe");
        assert_eq!(subscribe["v"][0], RELIANCE_TOKEN);
        assert_eq!(mode["v"][0], "full");
        assert_eq!(mode["v"][1][0], RELIANCE_TOKEN);

        let unsubscribe: serde_json::Value =
            serde_json::from_str(&unsubscribe_message(&subscription).unwrap()).unwrap();
        assert_eq!(unsubscribe["a"], "unsubscribe");
    }

    #[test]
    fn test_ticker_url_carries_credentials() {
        let session = BrokerSession {
            broker_id: "zerodha".to_string(),
            api_key: "kitefront".to_string(),
            client_id: "AB1234".to_string(),
            auth_token: "tok en".to_string(),
            feed_token: None,
        };
        let url = ticker_url(&session).unwrap();
        assert_eq!(url.host_str(), Some("ws.kite.trade"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("api_key".to_string(), "kitefront".to_string())));
        assert!(pairs.contains(&("access_token".to_string(), "tok en".to_string())));
    }
}
