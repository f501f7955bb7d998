//! Symbol Service
//!
//! Loads broker master contracts into the instrument resolver.

use crate::brokers::types::{Exchange, InstrumentKey, Token};
use crate::brokers::Broker;
use crate::error::Result;
use crate::feed::InstrumentResolver;
use tracing::{info, warn};

/// Symbol service for master contract operations
pub struct SymbolService;

impl SymbolService {
    /// Refresh the resolver from the broker's master contract.
    ///
    /// Each exchange is replaced only when its download succeeds; a failed
    /// exchange keeps its previous mappings. Returns the number of
    /// instruments imported.
    pub async fn refresh_symbol_master(
        rest: &dyn Broker,
        resolver: &InstrumentResolver,
        exchanges: &[Exchange],
    ) -> usize {
        info!("SymbolService::refresh_symbol_master ({})", rest.name());

        let mut total = 0;
        for &exchange in exchanges {
            match rest.download_master_contract(exchange).await {
                Ok(symbols) => {
                    resolver.clear_exchange(exchange);
                    total += resolver.import_batch(
                        exchange,
                        symbols.into_iter().map(|s| (s.symbol, s.token)),
                    );
                }
                Err(e) => warn!("Master contract download failed for {}: {}", exchange, e),
            }
        }

        info!("Loaded {} symbols", total);
        total
    }

    /// Token lookup from raw user input
    pub fn get_token(resolver: &InstrumentResolver, symbol: &str, exchange: &str) -> Result<Token> {
        resolver.resolve(&InstrumentKey::parse(symbol, exchange)?)
    }
}
