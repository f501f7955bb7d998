//! Instrument resolver
//!
//! Provides O(1) (exchange, symbol) -> token lookups. Populated by the
//! master contract import and by manual registration.

use crate::brokers::types::{Exchange, InstrumentKey, Token};
use crate::error::{AppError, Result};
use dashmap::DashMap;
use tracing::{info, warn};

/// Concurrent token map, safe for many readers and one bulk writer
#[derive(Debug, Default)]
pub struct InstrumentResolver {
    tokens: DashMap<InstrumentKey, Token>,
}

impl InstrumentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the token for a key; `NotFound` when unresolved
    pub fn resolve(&self, key: &InstrumentKey) -> Result<Token> {
        self.tokens
            .get(key)
            .map(|t| *t)
            .ok_or_else(|| AppError::NotFound(format!("No token registered for {}", key)))
    }

    /// Idempotent upsert of a single mapping
    pub fn register(&self, exchange: Exchange, symbol: &str, token: u64) -> Result<InstrumentKey> {
        let key = InstrumentKey::new(exchange, symbol)?;
        let token = Token::new(token)
            .ok_or_else(|| AppError::Validation(format!("Token for {} must be non-zero", key)))?;
        self.tokens.insert(key.clone(), token);
        Ok(key)
    }

    /// Bulk upsert used by master contract ingestion.
    ///
    /// Rows with an empty symbol or a zero token are skipped. Returns the
    /// number of rows imported.
    pub fn import_batch<I, S>(&self, exchange: Exchange, rows: I) -> usize
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut imported = 0;
        let mut skipped = 0;

        for (symbol, token) in rows {
            match (InstrumentKey::new(exchange, symbol.as_ref()), Token::new(token)) {
                (Ok(key), Some(token)) => {
                    self.tokens.insert(key, token);
                    imported += 1;
                }
                _ => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!("Skipped {} unusable {} master contract rows", skipped, exchange);
        }
        info!("Imported {} {} instruments", imported, exchange);
        imported
    }

    /// Drop every mapping for one exchange (before a fresh import)
    pub fn clear_exchange(&self, exchange: Exchange) {
        self.tokens.retain(|key, _| key.exchange() != exchange);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_then_resolve() {
        let resolver = InstrumentResolver::new();
        let key = resolver.register(Exchange::Nse, "reliance", 2885).unwrap();
        assert_eq!(resolver.resolve(&key).unwrap().get(), 2885);

        // Upsert overwrites
        resolver.register(Exchange::Nse, "RELIANCE", 500).unwrap();
        assert_eq!(resolver.resolve(&key).unwrap().get(), 500);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_unregistered_is_not_found() {
        let resolver = InstrumentResolver::new();
        let key = InstrumentKey::new(Exchange::Nse, "TCS").unwrap();
        let err = resolver.resolve(&key).unwrap_err();
        assert!(err.is_resolution());
    }

    #[test]
    fn test_zero_token_rejected() {
        let resolver = InstrumentResolver::new();
        assert!(matches!(
            resolver.register(Exchange::Nse, "INFY", 0),
            Err(AppError::Validation(_))
        ));
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_import_batch_skips_bad_rows() {
        let resolver = InstrumentResolver::new();
        let rows = vec![("SBIN", 3045u64), ("", 1), ("ZERO", 0), ("INFY", 1594)];
        assert_eq!(resolver.import_batch(Exchange::Nse, rows), 2);

        let sbin = InstrumentKey::new(Exchange::Nse, "SBIN").unwrap();
        assert_eq!(resolver.resolve(&sbin).unwrap().get(), 3045);
        // Same symbol on another exchange stays unresolved
        let bse = InstrumentKey::new(Exchange::Bse, "SBIN").unwrap();
        assert!(resolver.resolve(&bse).is_err());
    }

    #[test]
    fn test_clear_exchange() {
        let resolver = InstrumentResolver::new();
        resolver.import_batch(Exchange::Nse, vec![("SBIN", 3045u64)]);
        resolver.import_batch(Exchange::Bse, vec![("SBIN", 500112u64)]);
        resolver.clear_exchange(Exchange::Nse);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_concurrent_readers_with_bulk_writer() {
        let resolver = Arc::new(InstrumentResolver::new());
        resolver.register(Exchange::Nse, "SBIN", 3045).unwrap();

        let writer = {
            let resolver = Arc::clone(&resolver);
            std::thread::spawn(move || {
                let rows: Vec<(String, u64)> = (1..=1000).map(|i| (format!("SYM{}", i), i)).collect();
                resolver.import_batch(Exchange::Nfo, rows)
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                std::thread::spawn(move || {
                    let key = InstrumentKey::new(Exchange::Nse, "SBIN").unwrap();
                    for _ in 0..1000 {
                        assert_eq!(resolver.resolve(&key).unwrap().get(), 3045);
                    }
                })
            })
            .collect();

        assert_eq!(writer.join().unwrap(), 1000);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(resolver.len(), 1001);
    }
}
