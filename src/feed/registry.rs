//! Subscription registry
//!
//! The authoritative set of instruments the application wants live data for,
//! independent of which transport is currently serving them.

use crate::brokers::types::{Exchange, InstrumentKey, SubscriptionMode, Token};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// One outstanding interest in an instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub key: InstrumentKey,
    pub token: Token,
    pub mode: SubscriptionMode,
}

#[derive(Debug)]
struct Entry {
    subscription: Subscription,
    seq: u64,
}

/// Token index slot: keys sharing a token, by subscription order
type TokenSlot = BTreeMap<u64, InstrumentKey>;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<InstrumentKey, Entry>,
    /// Push packet routing; each entry is filed under its exchange and `None`
    by_token: HashMap<(Option<Exchange>, Token), TokenSlot>,
    next_seq: u64,
}

impl Inner {
    fn index(&mut self, subscription: &Subscription, seq: u64) {
        for exchange in [Some(subscription.key.exchange()), None] {
            self.by_token
                .entry((exchange, subscription.token))
                .or_default()
                .insert(seq, subscription.key.clone());
        }
    }

    fn unindex(&mut self, subscription: &Subscription, seq: u64) {
        for exchange in [Some(subscription.key.exchange()), None] {
            let slot = (exchange, subscription.token);
            if let Some(keys) = self.by_token.get_mut(&slot) {
                keys.remove(&seq);
                if keys.is_empty() {
                    self.by_token.remove(&slot);
                }
            }
        }
    }
}

/// Key -> subscription map guarded by a single mutex.
///
/// `list()` hands out a copy so pollers can iterate without holding the lock
/// across network calls. Snapshot order is insertion order; overwriting an
/// existing key keeps its original position.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the subscription for `key`.
    ///
    /// Returns the previous subscription when one was replaced.
    pub fn add(&self, key: InstrumentKey, token: Token, mode: SubscriptionMode) -> Option<Subscription> {
        let mut inner = self.inner.lock();
        let subscription = Subscription {
            key: key.clone(),
            token,
            mode,
        };

        if let Some(entry) = inner.entries.get_mut(&key) {
            let seq = entry.seq;
            let previous = std::mem::replace(&mut entry.subscription, subscription.clone());
            inner.unindex(&previous, seq);
            inner.index(&subscription, seq);
            return Some(previous);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index(&subscription, seq);
        inner.entries.insert(key, Entry { subscription, seq });
        None
    }

    /// Remove the subscription for `key`, returning it if present
    pub fn remove(&self, key: &InstrumentKey) -> Option<Subscription> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(key)?;
        inner.unindex(&entry.subscription, entry.seq);
        Some(entry.subscription)
    }

    /// Point-in-time copy of all subscriptions in insertion order
    pub fn list(&self) -> Vec<Subscription> {
        let inner = self.inner.lock();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.subscription.clone()).collect()
    }

    pub fn contains(&self, key: &InstrumentKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn get(&self, key: &InstrumentKey) -> Option<Subscription> {
        self.inner.lock().entries.get(key).map(|e| e.subscription.clone())
    }

    /// Find the subscription a push packet belongs to.
    ///
    /// When the packet does not say which exchange it is for, the first
    /// subscription with a matching token wins.
    pub fn find_by_token(&self, exchange: Option<Exchange>, token: Token) -> Option<Subscription> {
        let inner = self.inner.lock();
        let (_, key) = inner.by_token.get(&(exchange, token))?.first_key_value()?;
        inner.entries.get(key).map(|e| e.subscription.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
