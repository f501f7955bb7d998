//! Fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use openalgo_feed::brokers::types::{Exchange, SymbolData, Tick, Token};
use openalgo_feed::brokers::zerodha::KiteQuote;
use openalgo_feed::brokers::{Broker, BrokerAdapters, BrokerSession, QuotePayload};
use openalgo_feed::config::FeedConfig;
use openalgo_feed::feed::{
    BroadcastSink, ConnectionState, FeedEvent, InstrumentResolver, MarketDataManager, PushTransport, Subscription,
    TransportEvent, TransportStatus,
};
use openalgo_feed::{AppError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{timeout, Instant};

/// How one `connect` call plays out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    Refuse,
    /// Reports Connected, then the socket drops before `connect` returns Ok
    DropBeforeOk,
    /// Reports an error on the session, then returns Err
    ErrorThenFail,
}

/// Push transport driven by the test
#[derive(Default)]
pub struct FakeTransport {
    /// Scripted connect outcomes; success once exhausted
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    gate: Mutex<Option<Arc<Notify>>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    failing_subscribes: Mutex<HashSet<u64>>,
    pub subscribed: Mutex<Vec<Subscription>>,
    pub unsubscribed: Mutex<Vec<Subscription>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl FakeTransport {
    pub fn with_outcomes(outcomes: &[bool]) -> Self {
        let script: Vec<ConnectOutcome> = outcomes
            .iter()
            .map(|&ok| if ok { ConnectOutcome::Succeed } else { ConnectOutcome::Refuse })
            .collect();
        Self::with_script(&script)
    }

    pub fn with_script(script: &[ConnectOutcome]) -> Self {
        let transport = Self::default();
        transport.outcomes.lock().extend(script.iter().copied());
        transport
    }

    /// Make `connect` wait until the returned gate is notified
    pub fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_subscribe(&self, token: u64) {
        self.failing_subscribes.lock().insert(token);
    }

    /// Deliver an event on the current session
    pub async fn emit(&self, event: TransportEvent) {
        let sender = self.events.lock().clone();
        sender.expect("transport never connected").send(event).await.unwrap();
    }

    pub async fn emit_status(&self, status: TransportStatus) {
        self.emit(TransportEvent::Status(status)).await;
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribed.lock().iter().map(|s| s.key.to_string()).collect()
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    fn broker_id(&self) -> &'static str {
        "zerodha"
    }

    async fn connect(&self, _session: &BrokerSession, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let outcome = self.outcomes.lock().pop_front().unwrap_or(ConnectOutcome::Succeed);
        if outcome == ConnectOutcome::Refuse {
            return Err(AppError::Transport("connection refused".to_string()));
        }
        *self.events.lock() = Some(events.clone());

        match outcome {
            ConnectOutcome::DropBeforeOk => {
                let _ = events.send(TransportEvent::Status(TransportStatus::Connected)).await;
                let _ = events.send(TransportEvent::Status(TransportStatus::Disconnected(None))).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            }
            ConnectOutcome::ErrorThenFail => {
                let _ = events
                    .send(TransportEvent::Status(TransportStatus::Error("handshake reset".to_string())))
                    .await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(AppError::Transport("handshake reset".to_string()))
            }
            _ => {
                let _ = events.send(TransportEvent::Status(TransportStatus::Connected)).await;
                Ok(())
            }
        }
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        if self.failing_subscribes.lock().contains(&subscription.token.get()) {
            return Err(AppError::Transport("subscribe rejected".to_string()));
        }
        self.subscribed.lock().push(subscription.clone());
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.unsubscribed.lock().push(subscription.clone());
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// REST quote source with per-token prices and failures
#[derive(Default)]
pub struct FakeQuotes {
    prices: HashMap<u64, f64>,
    failing: HashSet<u64>,
    latency: Duration,
    pub calls: Mutex<Vec<(u64, Instant)>>,
}

impl FakeQuotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn price(mut self, token: u64, price: f64) -> Self {
        self.prices.insert(token, price);
        self
    }

    pub fn failing(mut self, token: u64) -> Self {
        self.failing.insert(token);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Broker for FakeQuotes {
    fn id(&self) -> &'static str {
        "zerodha"
    }

    fn name(&self) -> &'static str {
        "Fake quotes"
    }

    async fn get_quote(&self, _exchange: Exchange, token: Token) -> Result<QuotePayload> {
        self.calls.lock().push((token.get(), Instant::now()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.contains(&token.get()) {
            return Err(AppError::Broker("Too many requests".to_string()));
        }
        let quote: KiteQuote = serde_json::from_value(serde_json::json!({
            "instrument_token": token.get(),
            "last_price": self.prices.get(&token.get()).copied().unwrap_or(100.0),
            "volume": 1000,
        }))?;
        Ok(QuotePayload::Zerodha(quote))
    }

    async fn download_master_contract(&self, _exchange: Exchange) -> Result<Vec<SymbolData>> {
        Ok(Vec::new())
    }
}

pub struct Harness {
    pub manager: MarketDataManager,
    pub transport: Arc<FakeTransport>,
    pub quotes: Arc<FakeQuotes>,
    pub events: broadcast::Receiver<FeedEvent>,
}

pub fn config() -> FeedConfig {
    FeedConfig {
        poll_interval_ms: 1_000,
        symbol_delay_ms: 200,
        ..Default::default()
    }
}

pub fn session() -> BrokerSession {
    BrokerSession {
        broker_id: "zerodha".to_string(),
        api_key: "key".to_string(),
        client_id: "AB1234".to_string(),
        auth_token: "token".to_string(),
        feed_token: None,
    }
}

pub fn harness(transport: FakeTransport, quotes: FakeQuotes, config: FeedConfig) -> Harness {
    let transport = Arc::new(transport);
    let quotes = Arc::new(quotes);
    let sink = Arc::new(BroadcastSink::new(1_024));
    let events = sink.subscribe();

    let adapters = BrokerAdapters {
        rest: quotes.clone(),
        transport: transport.clone(),
    };
    let manager = MarketDataManager::new(session(), adapters, Arc::new(InstrumentResolver::new()), sink, &config);

    Harness {
        manager,
        transport,
        quotes,
        events,
    }
}

/// Wait (on the paused clock) until the feed reaches `state`
pub async fn wait_for_state(manager: &MarketDataManager, state: ConnectionState) {
    let mut changes = manager.state_changes();
    timeout(Duration::from_secs(30), changes.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("feed never reached {:?}", state))
        .unwrap();
}

/// Next tick emitted within `within`, skipping other events
pub async fn next_tick(events: &mut broadcast::Receiver<FeedEvent>, within: Duration) -> Option<Tick> {
    timeout(within, async {
        loop {
            match events.recv().await {
                Ok(FeedEvent::Tick(tick)) => return Some(tick),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
