//! Feed configuration
//!
//! Settings come from an optional JSON file named by `OPENALGO_FEED_CONFIG`,
//! then individual environment overrides. Broker credentials are read from
//! the environment only.

use crate::brokers::types::{Exchange, SubscriptionMode};
use crate::brokers::BrokerSession;
use crate::error::{AppError, Result};
use crate::scheduler::{PollingConfig, ReconnectConfig};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_PATH_VAR: &str = "OPENALGO_FEED_CONFIG";

/// A symbol the binary subscribes at startup
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    pub exchange: Exchange,
    #[serde(default = "default_mode")]
    pub mode: SubscriptionMode,
    /// Register this token instead of relying on the master contract
    #[serde(default)]
    pub token: Option<u64>,
}

fn default_mode() -> SubscriptionMode {
    SubscriptionMode::Ltp
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub poll_interval_ms: u64,
    pub symbol_delay_ms: u64,
    pub reconnect: ReconnectConfig,
    /// Capacity of the broadcast sink channel
    pub broadcast_capacity: usize,
    /// Download master contracts for `exchanges` on startup
    pub refresh_master_contract: bool,
    pub exchanges: Vec<Exchange>,
    pub symbols: Vec<SymbolConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            symbol_delay_ms: 200,
            reconnect: ReconnectConfig::default(),
            broadcast_capacity: 1_024,
            refresh_master_contract: false,
            exchanges: vec![Exchange::Nse],
            symbols: Vec::new(),
        }
    }
}

impl FeedConfig {
    /// Load from the file in `OPENALGO_FEED_CONFIG` (if set), then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).ok();
        let mut config = Self::load_from(path.as_deref().map(Path::new))?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file; defaults when no path is given
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        let config: FeedConfig = serde_json::from_str(&text)?;
        tracing::info!("Loaded feed config from {}", path.display());
        Ok(config)
    }

    /// Apply `FEED_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_var(&lookup, "FEED_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "FEED_SYMBOL_DELAY_MS")? {
            self.symbol_delay_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "FEED_RECONNECT_ENABLED")? {
            self.reconnect.enabled = value;
        }
        if let Some(value) = lookup("FEED_EXCHANGES") {
            self.exchanges = value
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(Exchange::from_str)
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.reconnect.enabled && self.reconnect.multiplier < 1.0 {
            return Err(AppError::Config("reconnect.multiplier must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn polling(&self) -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            symbol_delay: Duration::from_millis(self.symbol_delay_ms),
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| AppError::Config(format!("Invalid {}={}: {}", name, raw, e)))
        })
        .transpose()
}

/// Broker session from `BROKER_*` variables
pub fn session_from_env() -> Result<BrokerSession> {
    session_from_lookup(|name| std::env::var(name).ok())
}

pub fn session_from_lookup<F>(lookup: F) -> Result<BrokerSession>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |name: &str| {
        lookup(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::Config(format!("{} is not set", name)))
    };

    Ok(BrokerSession {
        broker_id: required("BROKER_ID")?.trim().to_lowercase(),
        api_key: required("BROKER_API_KEY")?,
        client_id: lookup("BROKER_CLIENT_ID").unwrap_or_default(),
        auth_token: required("BROKER_AUTH_TOKEN")?,
        feed_token: lookup("BROKER_FEED_TOKEN").filter(|v| !v.trim().is_empty()),
    })
}
