//! openalgo-feed: stream live ticks for the configured symbols until Ctrl-C

use anyhow::{Context, Result};
use openalgo_feed::brokers::BrokerAdapters;
use openalgo_feed::config::{self, FeedConfig};
use openalgo_feed::feed::{handlers, BroadcastSink, FeedEvent, InstrumentResolver, MarketDataManager};
use openalgo_feed::services::SymbolService;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    openalgo_feed::init_tracing();

    info!("Starting OpenAlgo Feed...");

    let config = FeedConfig::load().context("Failed to load feed config")?;
    let session = config::session_from_env().context("Broker session is not configured")?;
    let adapters = BrokerAdapters::for_session(&session)?;
    info!("Using broker {} ({:?})", adapters.rest.name(), session);

    let resolver = Arc::new(InstrumentResolver::new());
    if config.refresh_master_contract {
        SymbolService::refresh_symbol_master(&*adapters.rest, &resolver, &config.exchanges).await;
    }

    let sink = Arc::new(BroadcastSink::new(config.broadcast_capacity));
    let mut events = sink.subscribe();
    let manager = MarketDataManager::new(session, adapters, resolver, sink.clone(), &config);

    for symbol in &config.symbols {
        let exchange = symbol.exchange.as_str();
        if let Some(token) = symbol.token {
            manager.set_token(&symbol.symbol, exchange, token)?;
        }
        match manager.subscribe(&symbol.symbol, exchange, symbol.mode).await {
            Ok(key) => info!("Subscribed {} ({:?})", key, symbol.mode),
            Err(e) => warn!("Cannot subscribe {}:{}: {}", exchange, symbol.symbol, e),
        }
    }

    manager.connect().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(FeedEvent::Tick(tick)) => handlers::on_market_tick(&tick),
                Ok(FeedEvent::Depth(depth)) => handlers::on_market_depth(&depth),
                Ok(FeedEvent::State(state)) => info!("Feed state: {:?}", state),
                Err(RecvError::Lagged(skipped)) => warn!("Log consumer lagged, skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await?;
    Ok(())
}
