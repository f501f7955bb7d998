//! Scheduler module for the market data feed
//!
//! Handles timed work the feed runs in the background:
//! - Degraded-mode REST polling
//! - Optional backoff for push reconnect attempts

mod polling;
mod reconnect;

pub use polling::{run_cycle, PollOrigin, PollResult, PollingConfig, PollingScheduler};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
