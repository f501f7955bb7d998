//! Degraded-mode polling scheduler
//!
//! While the push channel is down, walks a snapshot of the subscription
//! registry on a fixed interval and fetches one REST quote per entry.
//! Results go back to the feed event loop tagged with the scheduler
//! generation, so anything still in flight after `stop()` is recognisably
//! stale.

use crate::brokers::types::Tick;
use crate::brokers::Broker;
use crate::feed::normalizer::normalize_poll;
use crate::feed::registry::{Subscription, SubscriptionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Time between the start of two cycles
    pub interval: Duration,
    /// Pause between two quote requests inside a cycle
    pub symbol_delay: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1_000),
            symbol_delay: Duration::from_millis(200),
        }
    }
}

/// Why a quote was polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOrigin {
    /// Scheduled cycle started under this generation
    Cycle { generation: u64 },
    /// One-off fetch after a failed push subscribe
    Remediation,
}

/// A normalized polled tick on its way to the event loop
#[derive(Debug, Clone)]
pub struct PollResult {
    pub origin: PollOrigin,
    pub subscription: Subscription,
    pub tick: Tick,
}

/// Owned by the feed event loop; at most one polling task at a time.
pub struct PollingScheduler {
    rest: Arc<dyn Broker>,
    registry: Arc<SubscriptionRegistry>,
    results: mpsc::Sender<PollResult>,
    config: PollingConfig,
    generation: u64,
    cancel: Option<CancellationToken>,
}

impl PollingScheduler {
    pub fn new(
        rest: Arc<dyn Broker>,
        registry: Arc<SubscriptionRegistry>,
        results: mpsc::Sender<PollResult>,
        config: PollingConfig,
    ) -> Self {
        Self {
            rest,
            registry,
            results,
            config,
            generation: 0,
            cancel: None,
        }
    }

    /// Current generation; results tagged with any other value are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Spawn the polling task. No-op when already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let rest = Arc::clone(&self.rest);
        let registry = Arc::clone(&self.registry);
        let results = self.results.clone();
        let config = self.config;
        let origin = PollOrigin::Cycle {
            generation: self.generation,
        };

        info!(
            "Polling started (every {:?}, {:?} between symbols)",
            config.interval, config.symbol_delay
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !run_cycle(&*rest, &registry, &results, origin, config.symbol_delay, &cancel).await {
                    break;
                }
            }
            debug!("Polling task finished");
        });
    }

    /// Cancel the polling task and invalidate its in-flight results
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            info!("Polling stopped");
        }
        self.generation += 1;
    }

    /// Fetch a single subscription now, outside the cycle
    pub fn poll_once(&self, subscription: Subscription) {
        let rest = Arc::clone(&self.rest);
        let results = self.results.clone();

        tokio::spawn(async move {
            match poll_quote(&*rest, &subscription).await {
                Some(tick) => {
                    let _ = results
                        .send(PollResult {
                            origin: PollOrigin::Remediation,
                            subscription,
                            tick,
                        })
                        .await;
                }
                None => debug!("Remediation poll for {} produced nothing", subscription.key),
            }
        });
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

async fn poll_quote(rest: &dyn Broker, subscription: &Subscription) -> Option<Tick> {
    match rest.get_quote(subscription.key.exchange(), subscription.token).await {
        Ok(quote) => Some(normalize_poll(&quote, subscription)),
        Err(e) => {
            warn!("Quote poll failed for {}: {}", subscription.key, e);
            None
        }
    }
}

/// One pass over a registry snapshot, in registry order.
///
/// Returns `false` when the task should end (cancelled, or the event loop
/// is gone).
pub async fn run_cycle(
    rest: &dyn Broker,
    registry: &SubscriptionRegistry,
    results: &mpsc::Sender<PollResult>,
    origin: PollOrigin,
    symbol_delay: Duration,
    cancel: &CancellationToken,
) -> bool {
    let snapshot = registry.list();
    if snapshot.is_empty() {
        debug!("Nothing subscribed; skipping poll cycle");
        return true;
    }

    for (i, subscription) in snapshot.into_iter().enumerate() {
        if i > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(symbol_delay) => {}
            }
        }

        let tick = tokio::select! {
            _ = cancel.cancelled() => return false,
            tick = poll_quote(rest, &subscription) => tick,
        };

        if let Some(tick) = tick {
            let result = PollResult {
                origin,
                subscription,
                tick,
            };
            if results.send(result).await.is_err() {
                return false;
            }
        }
    }

    !cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::types::*;
    use crate::brokers::zerodha::KiteQuote;
    use crate::brokers::QuotePayload;
    use crate::error::{AppError, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Records each quote request and fails for one token
    struct RecordingBroker {
        calls: Mutex<Vec<(u64, Instant)>>,
        failing: Option<u64>,
    }

    impl RecordingBroker {
        fn new(failing: Option<u64>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing,
            }
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        fn id(&self) -> &'static str {
            "zerodha"
        }

        fn name(&self) -> &'static str {
            "Recording"
        }

        async fn get_quote(&self, _exchange: Exchange, token: Token) -> Result<QuotePayload> {
            self.calls.lock().push((token.get(), Instant::now()));
            if Some(token.get()) == self.failing {
                return Err(AppError::Broker("Too many requests".to_string()));
            }
            let quote: KiteQuote = serde_json::from_value(serde_json::json!({
                "instrument_token": token.get(),
                "last_price": 100.5,
            }))?;
            Ok(QuotePayload::Zerodha(quote))
        }

        async fn download_master_contract(&self, _exchange: Exchange) -> Result<Vec<SymbolData>> {
            Ok(Vec::new())
        }
    }

    fn registry_with(symbols: &[(&str, u64)]) -> Arc<SubscriptionRegistry> {
        let registry = Arc::new(SubscriptionRegistry::new());
        for (symbol, token) in symbols {
            registry.add(
                InstrumentKey::new(Exchange::Nse, symbol).unwrap(),
                Token::new(*token).unwrap(),
                SubscriptionMode::Ltp,
            );
        }
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_in_order_with_delay_and_failure() {
        let broker = RecordingBroker::new(Some(2));
        let registry = registry_with(&[("A", 1), ("B", 2), ("C", 3)]);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let delay = Duration::from_millis(200);

        let origin = PollOrigin::Cycle { generation: 0 };
        assert!(run_cycle(&broker, &registry, &tx, origin, delay, &cancel).await);

        let calls = broker.calls.lock().clone();
        let tokens: Vec<u64> = calls.iter().map(|(t, _)| *t).collect();
        assert_eq!(tokens, vec![1, 2, 3]);
        assert!(calls[1].1 - calls[0].1 >= delay);
        assert!(calls[2].1 - calls[1].1 >= delay);

        // The failing middle symbol is skipped, the others delivered
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.subscription.key.symbol(), "A");
        assert_eq!(second.subscription.key.symbol(), "C");
        assert_eq!(second.tick.source, TickSource::Poll);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_is_noop() {
        let broker = RecordingBroker::new(None);
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let origin = PollOrigin::Cycle { generation: 0 };
        assert!(run_cycle(&broker, &registry, &tx, origin, Duration::ZERO, &cancel).await);
        assert!(broker.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_bumps_generation_and_halts() {
        let broker = Arc::new(RecordingBroker::new(None));
        let registry = registry_with(&[("A", 1)]);
        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = PollingScheduler::new(
            broker.clone(),
            registry,
            tx,
            PollingConfig {
                interval: Duration::from_secs(1),
                symbol_delay: Duration::from_millis(10),
            },
        );

        scheduler.start();
        assert!(scheduler.is_running());
        let result = rx.recv().await.unwrap();
        assert_eq!(result.origin, PollOrigin::Cycle { generation: 0 });

        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.generation(), 1);

        let calls = broker.calls.lock().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(broker.calls.lock().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_is_tagged_remediation() {
        let broker = Arc::new(RecordingBroker::new(None));
        let registry = registry_with(&[("A", 1)]);
        let subscription = registry.list().remove(0);
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = PollingScheduler::new(broker, registry, tx, PollingConfig::default());

        scheduler.poll_once(subscription.clone());
        let result = rx.recv().await.unwrap();
        assert_eq!(result.origin, PollOrigin::Remediation);
        assert_eq!(result.subscription, subscription);
        assert!(!scheduler.is_running());
    }
}
