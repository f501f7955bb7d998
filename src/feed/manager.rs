//! Market data connection manager
//!
//! [`MarketDataManager`] is a cheap handle; the state machine itself runs on
//! a single event loop task that owns the connection state, the push
//! transport session and the polling scheduler. Handle calls, transport
//! events, connect results and poll results are all consumed there, one at a
//! time.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok/connected--> Live
//!                                 |                        |  ^
//!                          err/disconnected      disconnected  connected
//!                                 v                        v  |
//!                                 +--------------------> Degraded (polling)
//! ```
//! `shutdown()` returns any state to Disconnected and leaves the
//! subscription registry alone.

use crate::brokers::types::{InstrumentKey, SubscriptionMode};
use crate::brokers::{BrokerAdapters, BrokerSession, WirePacket};
use crate::config::FeedConfig;
use crate::error::{AppError, Result};
use crate::feed::handlers;
use crate::feed::normalizer::{normalize_push_depth, normalize_push_tick};
use crate::feed::registry::{Subscription, SubscriptionRegistry};
use crate::feed::resolver::InstrumentResolver;
use crate::feed::sink::MarketDataSink;
use crate::feed::transport::{PushTransport, TransportEvent, TransportStatus};
use crate::scheduler::{PollOrigin, PollResult, PollingScheduler, ReconnectPolicy};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 4_096;

/// Feed connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Push transport up and serving the registry
    Live,
    /// Push transport down; subscriptions are being polled
    Degraded,
}

enum Command {
    Connect,
    Subscribe {
        subscription: Subscription,
        previous: Option<Subscription>,
    },
    Unsubscribe(Subscription),
    Shutdown(oneshot::Sender<()>),
}

/// Messages produced by tasks the event loop spawned
enum Internal {
    Transport { epoch: u64, event: TransportEvent },
    ConnectResult { epoch: u64, result: Result<()> },
    ReconnectDue { epoch: u64 },
}

/// Handle to a running market data feed.
///
/// Clones share the same feed. The event loop ends once every handle is
/// dropped, disconnecting the transport on the way out.
#[derive(Clone)]
pub struct MarketDataManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    registry: Arc<SubscriptionRegistry>,
    resolver: Arc<InstrumentResolver>,
}

impl MarketDataManager {
    /// Build the feed and spawn its event loop. Must be called from within a
    /// tokio runtime.
    pub fn new(
        session: BrokerSession,
        adapters: BrokerAdapters,
        resolver: Arc<InstrumentResolver>,
        sink: Arc<dyn MarketDataSink>,
        config: &FeedConfig,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(EVENT_BUFFER);
        let (polls_tx, polls_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = FeedActor {
            broker_id: adapters.transport.broker_id(),
            session,
            transport: adapters.transport,
            registry: Arc::clone(&registry),
            sink,
            state: state_tx,
            poller: PollingScheduler::new(adapters.rest, Arc::clone(&registry), polls_tx, config.polling()),
            reconnect: ReconnectPolicy::new(config.reconnect.clone()),
            epoch: 0,
            session_ended: false,
            internal: internal_tx,
        };
        tokio::spawn(actor.run(commands_rx, internal_rx, polls_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            registry,
            resolver,
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::Internal("Market data feed has stopped".to_string()))
    }

    /// Open the push transport. A no-op unless currently Disconnected.
    pub async fn connect(&self) -> Result<()> {
        self.send(Command::Connect).await
    }

    /// Tear down the transport and polling and wait for Disconnected.
    /// Subscriptions are kept for the next `connect()`.
    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Shutdown(done_tx)).await?;
        done_rx
            .await
            .map_err(|_| AppError::Internal("Market data feed stopped during shutdown".to_string()))
    }

    /// Subscribe to live data for `symbol` on `exchange`.
    ///
    /// Fails only when the exchange or symbol is invalid or the symbol has no
    /// token. Subscribing again replaces the mode.
    pub async fn subscribe(&self, symbol: &str, exchange: &str, mode: SubscriptionMode) -> Result<InstrumentKey> {
        let key = InstrumentKey::parse(symbol, exchange)?;
        let token = self.resolver.resolve(&key)?;

        let previous = self.registry.add(key.clone(), token, mode);
        let subscription = Subscription {
            key: key.clone(),
            token,
            mode,
        };
        self.send(Command::Subscribe { subscription, previous }).await?;
        Ok(key)
    }

    /// Drop interest in `symbol`. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, symbol: &str, exchange: &str) -> Result<bool> {
        let key = InstrumentKey::parse(symbol, exchange)?;
        match self.registry.remove(&key) {
            Some(subscription) => {
                self.send(Command::Unsubscribe(subscription)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Register a token by hand (outside the master contract)
    pub fn set_token(&self, symbol: &str, exchange: &str, token: u64) -> Result<InstrumentKey> {
        self.resolver.register(exchange.parse()?, symbol, token)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Current subscriptions in subscription order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.list()
    }

    pub fn resolver(&self) -> &Arc<InstrumentResolver> {
        &self.resolver
    }
}

struct FeedActor {
    broker_id: &'static str,
    session: BrokerSession,
    transport: Arc<dyn PushTransport>,
    registry: Arc<SubscriptionRegistry>,
    sink: Arc<dyn MarketDataSink>,
    state: watch::Sender<ConnectionState>,
    poller: PollingScheduler,
    reconnect: ReconnectPolicy,
    /// Bumped per connect attempt and on shutdown; older results are stale
    epoch: u64,
    /// The current epoch's session reported Disconnected or Error. Its
    /// connect result was already accounted for by that status.
    session_ended: bool,
    internal: mpsc::Sender<Internal>,
}

impl FeedActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
        mut polls: mpsc::Receiver<PollResult>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
                Some(result) = polls.recv() => self.handle_poll(result),
            }
        }

        debug!("All feed handles dropped; stopping {} feed", self.broker_id);
        self.shutdown().await;
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.current();
        if previous == next {
            return;
        }
        self.state.send_replace(next);
        handlers::on_state_change(self.broker_id, previous, next);
        self.sink.on_connection_state_change(next);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let state = self.current();
                if state != ConnectionState::Disconnected {
                    info!("Connect ignored; feed is already {:?}", state);
                    return;
                }
                self.set_state(ConnectionState::Connecting);
                self.start_attempt();
            }
            Command::Subscribe { subscription, previous } => {
                if self.current() != ConnectionState::Live {
                    // Reconciliation or the poller picks it up
                    return;
                }
                if let Some(previous) = previous.filter(|p| *p != subscription) {
                    if let Err(e) = self.transport.unsubscribe(&previous).await {
                        warn!("Failed to unsubscribe replaced {}: {}", previous.key, e);
                    }
                }
                let current = self.registry.get(&subscription.key);
                if current.as_ref() == Some(&subscription) && self.push_subscribe(&subscription).await {
                    handlers::on_subscribed(self.broker_id, &[subscription.key.to_string()]);
                }
            }
            Command::Unsubscribe(subscription) => {
                if self.current() != ConnectionState::Live {
                    return;
                }
                match self.transport.unsubscribe(&subscription).await {
                    Ok(()) => handlers::on_unsubscribed(self.broker_id, &[subscription.key.to_string()]),
                    Err(e) => warn!("Failed to unsubscribe {}: {}", subscription.key, e),
                }
            }
            Command::Shutdown(done) => {
                self.shutdown().await;
                let _ = done.send(());
            }
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::ConnectResult { epoch, result } => {
                if epoch != self.epoch {
                    debug!("Discarding stale connect result (attempt {})", epoch);
                    // Session opened after shutdown; close it again
                    if result.is_ok() && self.current() == ConnectionState::Disconnected {
                        self.transport.disconnect().await;
                    }
                    return;
                }
                if self.session_ended {
                    debug!("Connect attempt {} ended before its result arrived", epoch);
                    return;
                }
                self.session_ended = result.is_err();
                match (self.current(), result) {
                    (ConnectionState::Connecting | ConnectionState::Degraded, Ok(())) => self.go_live().await,
                    (ConnectionState::Connecting, Err(e)) => {
                        handlers::on_error(self.broker_id, &e.to_string());
                        self.go_degraded();
                    }
                    (ConnectionState::Degraded, Err(e)) => {
                        warn!("Reconnect to {} failed: {}", self.broker_id, e);
                        self.schedule_reconnect();
                    }
                    _ => {}
                }
            }
            Internal::Transport { epoch, event } => {
                if epoch != self.epoch {
                    debug!("Discarding event from stale transport session {}", epoch);
                    return;
                }
                self.handle_transport(event).await;
            }
            Internal::ReconnectDue { epoch } => {
                if epoch != self.epoch || self.current() != ConnectionState::Degraded {
                    return;
                }
                handlers::on_reconnecting(self.broker_id, self.reconnect.attempt_count());
                self.transport.disconnect().await;
                self.start_attempt();
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(TransportStatus::Connected) => {
                self.session_ended = false;
                if matches!(self.current(), ConnectionState::Connecting | ConnectionState::Degraded) {
                    self.go_live().await;
                }
            }
            TransportEvent::Status(status) => {
                match &status {
                    TransportStatus::Disconnected(reason) => {
                        handlers::on_disconnected(self.broker_id, reason.as_deref())
                    }
                    TransportStatus::Error(error) => handlers::on_error(self.broker_id, error),
                    TransportStatus::Connected => {}
                }
                if self.session_ended {
                    return;
                }
                self.session_ended = true;
                match self.current() {
                    ConnectionState::Connecting | ConnectionState::Live => self.go_degraded(),
                    // A reconnect attempt that never came up
                    ConnectionState::Degraded => self.schedule_reconnect(),
                    ConnectionState::Disconnected => {}
                }
            }
            TransportEvent::Tick(packet) => {
                if self.current() == ConnectionState::Disconnected {
                    return;
                }
                match self.lookup(&packet) {
                    Some(subscription) => self.sink.on_tick(normalize_push_tick(&packet, &subscription)),
                    None => debug!("Tick for unsubscribed token {:?}", packet.token()),
                }
            }
            TransportEvent::Depth(packet) => {
                if self.current() == ConnectionState::Disconnected {
                    return;
                }
                if let Some(subscription) = self.lookup(&packet) {
                    if subscription.mode == SubscriptionMode::Full {
                        if let Some(depth) = normalize_push_depth(&packet, &subscription) {
                            self.sink.on_depth(depth);
                        }
                    }
                }
            }
        }
    }

    fn handle_poll(&mut self, result: PollResult) {
        let accepted = match result.origin {
            PollOrigin::Cycle { generation } => {
                generation == self.poller.generation() && self.current() == ConnectionState::Degraded
            }
            PollOrigin::Remediation => self.current() != ConnectionState::Disconnected,
        };
        if !accepted {
            debug!("Dropping stale poll result for {}", result.subscription.key);
            return;
        }
        if !self.registry.contains(&result.subscription.key) {
            return;
        }

        let depth = result.tick.depth.clone();
        self.sink.on_tick(result.tick);
        if let Some(depth) = depth {
            self.sink.on_depth(depth);
        }
    }

    /// Registry entry a push packet belongs to
    fn lookup(&self, packet: &WirePacket) -> Option<Subscription> {
        let token = packet.token()?;
        self.registry
            .find_by_token(packet.exchange(), token)
            .or_else(|| self.registry.find_by_token(None, token))
    }

    /// Spawn a connect attempt under a fresh epoch
    fn start_attempt(&mut self) {
        self.epoch += 1;
        self.session_ended = false;
        let epoch = self.epoch;
        let transport = Arc::clone(&self.transport);
        let session = self.session.clone();
        let internal = self.internal.clone();

        tokio::spawn(async move {
            let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);

            let forward = internal.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    if forward.send(Internal::Transport { epoch, event }).await.is_err() {
                        break;
                    }
                }
            });

            let result = transport.connect(&session, events_tx).await;
            let _ = internal.send(Internal::ConnectResult { epoch, result }).await;
        });
    }

    async fn go_live(&mut self) {
        self.poller.stop();
        self.reconnect.reset();
        self.set_state(ConnectionState::Live);
        self.reconcile().await;
    }

    fn go_degraded(&mut self) {
        self.set_state(ConnectionState::Degraded);
        self.poller.start();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.reconnect.is_enabled() {
            return;
        }
        let Some(delay) = self.reconnect.next_delay() else {
            warn!("Giving up reconnecting to {}; staying on polling", self.broker_id);
            return;
        };

        debug!("Next reconnect to {} in {:?}", self.broker_id, delay);
        let epoch = self.epoch;
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::ReconnectDue { epoch }).await;
        });
    }

    /// Push-subscribe everything in the registry
    async fn reconcile(&mut self) {
        let mut subscribed = Vec::new();
        for subscription in self.registry.list() {
            if self.push_subscribe(&subscription).await {
                subscribed.push(subscription.key.to_string());
            }
        }
        if !subscribed.is_empty() {
            handlers::on_subscribed(self.broker_id, &subscribed);
        }
    }

    /// A failed push subscribe falls back to one immediate poll
    async fn push_subscribe(&mut self, subscription: &Subscription) -> bool {
        match self.transport.subscribe(subscription).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Push subscribe failed for {}: {}; polling once", subscription.key, e);
                self.poller.poll_once(subscription.clone());
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        let state = self.current();
        if state == ConnectionState::Disconnected {
            return;
        }

        if state == ConnectionState::Live {
            let subscriptions = self.registry.list();
            for subscription in &subscriptions {
                if let Err(e) = self.transport.unsubscribe(subscription).await {
                    warn!("Failed to unsubscribe {} during shutdown: {}", subscription.key, e);
                }
            }
            let symbols: Vec<String> = subscriptions.iter().map(|s| s.key.to_string()).collect();
            handlers::on_unsubscribed(self.broker_id, &symbols);
        }

        self.transport.disconnect().await;
        self.poller.stop();
        self.reconnect.reset();
        self.epoch += 1;
        self.set_state(ConnectionState::Disconnected);
    }
}
