//! Reconnect policy
//!
//! Exponential backoff with jitter for timed push reconnects while the feed
//! is degraded. Off unless `enabled` is set; recovery is otherwise driven by
//! transport status events alone.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Reconnect settings as they appear in the feed config
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay to randomize by, e.g. 0.1 = +/-10%
    pub jitter_factor: f64,
    /// 0 = unlimited
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: 1_000,
            max_delay_ms: 64_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = Duration::from_millis(config.initial_delay_ms);
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Delay before the next attempt; `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);

        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            scaled as u64
        } else {
            0
        };
        self.current_delay = Duration::from_millis(next_millis.min(self.config.max_delay_ms));

        Some(delay)
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.current_delay = Duration::from_millis(self.config.initial_delay_ms);
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((base_millis + jitter).max(1.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter_factor: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_factor,
            max_attempts,
        }
    }

    #[test]
    fn test_disabled_by_default() {
        assert!(!ReconnectPolicy::new(ReconnectConfig::default()).is_enabled());
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let mut policy = ReconnectPolicy::new(config(0.0, 0));
        let delays: Vec<u64> = (0..6)
            .map(|_| policy.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut policy = ReconnectPolicy::new(config(0.1, 0));
        for _ in 0..50 {
            policy.reset();
            let delay = policy.next_delay().unwrap().as_millis();
            assert!((90..=110).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn test_max_attempts_and_reset() {
        let mut policy = ReconnectPolicy::new(config(0.0, 2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }
}
