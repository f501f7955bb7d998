//! Tick normalizer
//!
//! The only place broker wire structs become [`Tick`] / [`DepthSnapshot`].
//! Every "field A or field B" fallback lives here so the sink sees the same
//! shape whichever transport produced the data.

use crate::brokers::angel::stream::{AngelDepthEntry, AngelPacket};
use crate::brokers::angel::{AngelDepthLevel, AngelQuote};
use crate::brokers::types::*;
use crate::brokers::zerodha::stream::{price_divisor, KiteDepthEntry, KitePacket};
use crate::brokers::zerodha::{KiteDepthLevel, KiteQuote};
use crate::brokers::{QuotePayload, WirePacket};
use crate::feed::registry::Subscription;
use chrono::{NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;

const ANGEL_TIME_FORMAT: &str = "%d-%b-%Y %H:%M:%S";
const KITE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SmartStream exchange type for currency derivatives
const ANGEL_CDS: u8 = 13;

/// Canonical tick from a push packet
pub fn normalize_push_tick(packet: &WirePacket, subscription: &Subscription) -> Tick {
    let tick = match packet {
        WirePacket::Angel(p) => angel_push_tick(p, subscription),
        WirePacket::Zerodha(p) => kite_push_tick(p, subscription),
    };
    restrict_to_mode(tick)
}

/// Order book ladder from a push packet, when it carries one
pub fn normalize_push_depth(packet: &WirePacket, subscription: &Subscription) -> Option<DepthSnapshot> {
    match packet {
        WirePacket::Angel(p) => angel_push_depth(p, subscription),
        WirePacket::Zerodha(p) => kite_push_depth(p, subscription),
    }
}

/// Canonical tick from a REST quote
pub fn normalize_poll(quote: &QuotePayload, subscription: &Subscription) -> Tick {
    let tick = match quote {
        QuotePayload::Angel(q) => angel_poll_tick(q, subscription),
        QuotePayload::Zerodha(q) => kite_poll_tick(q, subscription),
    };
    restrict_to_mode(tick)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Broker local time (IST) to epoch milliseconds
fn parse_ist(value: &str, format: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), format).ok()?;
    Kolkata
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_millis())
}

fn non_negative(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

fn empty_tick(subscription: &Subscription, source: TickSource) -> Tick {
    Tick {
        symbol: subscription.key.symbol().to_string(),
        exchange: subscription.key.exchange(),
        token: subscription.token,
        mode: subscription.mode,
        ltp: 0.0,
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
        timestamp: 0,
        source,
    }
}

fn snapshot(
    subscription: &Subscription,
    bids: Vec<DepthLevel>,
    asks: Vec<DepthLevel>,
    timestamp: i64,
) -> Option<DepthSnapshot> {
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    Some(DepthSnapshot {
        symbol: subscription.key.symbol().to_string(),
        exchange: subscription.key.exchange(),
        token: subscription.token,
        bids,
        asks,
        timestamp,
    })
}

/// Fill top of book from the ladder and attach it
fn with_depth(mut tick: Tick, depth: Option<DepthSnapshot>) -> Tick {
    if let Some(depth) = &depth {
        if let Some(best) = depth.bids.first() {
            tick.bid = Some(best.price);
            tick.bid_qty = Some(best.quantity);
        }
        if let Some(best) = depth.asks.first() {
            tick.ask = Some(best.price);
            tick.ask_qty = Some(best.quantity);
        }
    }
    tick.depth = depth;
    tick
}

/// Drop the fields the subscription mode does not carry
fn restrict_to_mode(mut tick: Tick) -> Tick {
    match tick.mode {
        SubscriptionMode::Full => {}
        SubscriptionMode::Quote => tick.depth = None,
        SubscriptionMode::Ltp => {
            tick.bid = None;
            tick.ask = None;
            tick.bid_qty = None;
            tick.ask_qty = None;
            tick.last_qty = None;
            tick.average_price = None;
            tick.volume = None;
            tick.open_interest = None;
            tick.ohlc = None;
            tick.depth = None;
        }
    }
    tick
}

// Angel One

fn angel_divisor(exchange_type: u8) -> f64 {
    if exchange_type == ANGEL_CDS {
        10_000_000.0
    } else {
        100.0
    }
}

fn angel_push_timestamp(packet: &AngelPacket) -> i64 {
    if packet.exchange_timestamp > 0 {
        packet.exchange_timestamp
    } else {
        now_millis()
    }
}

fn angel_levels(entries: &[AngelDepthEntry], is_buy: bool, divisor: f64) -> Vec<DepthLevel> {
    entries
        .iter()
        .filter(|e| e.is_buy == is_buy && e.price > 0)
        .map(|e| DepthLevel {
            price: e.price as f64 / divisor,
            quantity: non_negative(e.quantity).unwrap_or_default(),
            orders: u32::try_from(e.orders).unwrap_or_default(),
        })
        .collect()
}

fn angel_push_depth(packet: &AngelPacket, subscription: &Subscription) -> Option<DepthSnapshot> {
    let snap = packet.snap.as_ref()?;
    let divisor = angel_divisor(packet.exchange_type);
    snapshot(
        subscription,
        angel_levels(&snap.best_five, true, divisor),
        angel_levels(&snap.best_five, false, divisor),
        angel_push_timestamp(packet),
    )
}

fn angel_push_tick(packet: &AngelPacket, subscription: &Subscription) -> Tick {
    let divisor = angel_divisor(packet.exchange_type);
    let mut tick = empty_tick(subscription, TickSource::Push);
    tick.ltp = packet.ltp as f64 / divisor;
    tick.timestamp = angel_push_timestamp(packet);

    if let Some(q) = &packet.quote {
        tick.last_qty = non_negative(q.last_traded_qty);
        tick.average_price = Some(q.avg_traded_price as f64 / divisor);
        tick.volume = non_negative(q.volume);
        tick.ohlc = Some(Ohlc {
            open: q.open as f64 / divisor,
            high: q.high as f64 / divisor,
            low: q.low as f64 / divisor,
            close: q.close as f64 / divisor,
        });
    }

    if let Some(snap) = &packet.snap {
        tick.open_interest = non_negative(snap.open_interest);
    }

    with_depth(tick, angel_push_depth(packet, subscription))
}

fn angel_rest_levels(levels: &[AngelDepthLevel]) -> Vec<DepthLevel> {
    levels
        .iter()
        .filter_map(|l| {
            let price = l.price.filter(|p| *p > 0.0)?;
            Some(DepthLevel {
                price,
                quantity: l.quantity.unwrap_or_default(),
                orders: l.orders.and_then(|o| u32::try_from(o).ok()).unwrap_or_default(),
            })
        })
        .collect()
}

fn angel_poll_tick(quote: &AngelQuote, subscription: &Subscription) -> Tick {
    let mut tick = empty_tick(subscription, TickSource::Poll);
    tick.ltp = quote.ltp.unwrap_or_default();
    tick.timestamp = [&quote.exch_feed_time, &quote.exch_trade_time]
        .into_iter()
        .flatten()
        .find_map(|t| parse_ist(t, ANGEL_TIME_FORMAT))
        .unwrap_or_else(now_millis);
    tick.last_qty = quote.last_trade_qty;
    tick.average_price = quote.avg_price;
    tick.volume = quote.trade_volume;
    tick.open_interest = quote.opn_interest;

    if [quote.open, quote.high, quote.low, quote.close].iter().any(Option::is_some) {
        tick.ohlc = Some(Ohlc {
            open: quote.open.unwrap_or_default(),
            high: quote.high.unwrap_or_default(),
            low: quote.low.unwrap_or_default(),
            close: quote.close.unwrap_or_default(),
        });
    }

    let depth = quote.depth.as_ref().and_then(|d| {
        snapshot(
            subscription,
            angel_rest_levels(&d.buy),
            angel_rest_levels(&d.sell),
            tick.timestamp,
        )
    });
    with_depth(tick, depth)
}

// Zerodha

fn kite_timestamp(packet: &KitePacket) -> i64 {
    packet
        .exchange_timestamp
        .filter(|t| *t > 0)
        .map(|t| i64::from(t) * 1000)
        .unwrap_or_else(now_millis)
}

fn kite_levels(entries: &[KiteDepthEntry], is_buy: bool, divisor: f64) -> Vec<DepthLevel> {
    entries
        .iter()
        .filter(|e| e.is_buy == is_buy && e.price > 0)
        .map(|e| DepthLevel {
            price: f64::from(e.price) / divisor,
            quantity: u64::from(e.quantity),
            orders: u32::from(e.orders),
        })
        .collect()
}

fn kite_push_depth(packet: &KitePacket, subscription: &Subscription) -> Option<DepthSnapshot> {
    let divisor = price_divisor(packet.instrument_token);
    snapshot(
        subscription,
        kite_levels(&packet.depth, true, divisor),
        kite_levels(&packet.depth, false, divisor),
        kite_timestamp(packet),
    )
}

fn kite_push_tick(packet: &KitePacket, subscription: &Subscription) -> Tick {
    let divisor = price_divisor(packet.instrument_token);
    let mut tick = empty_tick(subscription, TickSource::Push);
    tick.ltp = f64::from(packet.ltp) / divisor;
    tick.timestamp = kite_timestamp(packet);
    tick.last_qty = packet.last_quantity.map(u64::from);
    tick.average_price = packet.average_price.map(|p| f64::from(p) / divisor);
    tick.volume = packet.volume.map(u64::from);
    tick.open_interest = packet.oi.map(u64::from);
    tick.ohlc = packet.ohlc.map(|o| Ohlc {
        open: f64::from(o.open) / divisor,
        high: f64::from(o.high) / divisor,
        low: f64::from(o.low) / divisor,
        close: f64::from(o.close) / divisor,
    });

    with_depth(tick, kite_push_depth(packet, subscription))
}

fn kite_rest_levels(levels: &[KiteDepthLevel]) -> Vec<DepthLevel> {
    levels
        .iter()
        .filter(|l| l.price > 0.0)
        .map(|l| DepthLevel {
            price: l.price,
            quantity: l.quantity,
            orders: l.orders,
        })
        .collect()
}

fn kite_poll_tick(quote: &KiteQuote, subscription: &Subscription) -> Tick {
    let mut tick = empty_tick(subscription, TickSource::Poll);
    tick.ltp = quote.last_price;
    tick.timestamp = [&quote.timestamp, &quote.last_trade_time]
        .into_iter()
        .flatten()
        .find_map(|t| parse_ist(t, KITE_TIME_FORMAT))
        .unwrap_or_else(now_millis);
    tick.last_qty = quote.last_quantity;
    tick.average_price = quote.average_price;
    tick.volume = quote.volume;
    tick.open_interest = quote.oi.filter(|oi| *oi >= 0.0).map(|oi| oi as u64);
    tick.ohlc = quote.ohlc.as_ref().map(|o| Ohlc {
        open: o.open,
        high: o.high,
        low: o.low,
        close: o.close,
    });

    let depth = quote.depth.as_ref().and_then(|d| {
        snapshot(
            subscription,
            kite_rest_levels(&d.buy),
            kite_rest_levels(&d.sell),
            tick.timestamp,
        )
    });
    with_depth(tick, depth)
}
