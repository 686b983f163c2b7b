//! Ambient engine configuration.
//!
//! Loads tuning knobs from environment variables with the defaults spec.md
//! prescribes. This is distinct from the device/tag configuration object in
//! `model.rs` / `config_view.rs`, which the host supplies and which this
//! crate never reads from disk.

use anyhow::Result;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub metrics_port: u16,
    pub health_port: u16,
    pub connection: ConnectionDefaults,
    pub subscription: SubscriptionDefaults,
    pub monitored_item: MonitoredItemDefaults,
    pub batching: BatchingConfig,
}

/// Reconnection strategy defaults (spec.md §4.1: `maxRetry=1`,
/// `initialDelay=2000ms`, `maxDelay=max(timeout, 10000ms)`).
#[derive(Debug, Clone)]
pub struct ConnectionDefaults {
    pub max_retry: u32,
    pub initial_delay: Duration,
    pub min_max_delay: Duration,
}

impl ConnectionDefaults {
    /// `maxDelay` for a device with the given `timeout` (spec.md §4.1).
    pub fn max_delay_for(&self, device_timeout: Duration) -> Duration {
        device_timeout.max(self.min_max_delay)
    }
}

/// Subscription parameters applied on every `createSubscription` call
/// (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct SubscriptionDefaults {
    pub publishing_interval_ms: f64,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
}

/// Monitored-item parameters applied on every `subscription.monitor` call
/// (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct MonitoredItemDefaults {
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// Notification batching window (spec.md §6, §9).
#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub window: Duration,
    pub trans_id_margin: u64,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            max_retry: 1,
            initial_delay: Duration::from_millis(2000),
            min_max_delay: Duration::from_millis(10_000),
        }
    }
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            publishing_interval_ms: 1000.0,
            lifetime_count: 100,
            max_keep_alive_count: 10,
            max_notifications_per_publish: 10,
            priority: 10,
        }
    }
}

impl Default for MonitoredItemDefaults {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 1000.0,
            queue_size: 10,
            discard_oldest: true,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
            trans_id_margin: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "test".to_string(),
            metrics_port: 9090,
            health_port: 9091,
            connection: ConnectionDefaults::default(),
            subscription: SubscriptionDefaults::default(),
            monitored_item: MonitoredItemDefaults::default(),
            batching: BatchingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        Ok(Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9090".to_string())
                .parse()?,
            health_port: env::var("HEALTH_PORT")
                .unwrap_or_else(|_| "9091".to_string())
                .parse()?,
            connection: ConnectionDefaults {
                max_retry: env::var("OPC_MAX_RETRY")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
                initial_delay: Duration::from_millis(
                    env::var("OPC_INITIAL_DELAY_MS")
                        .unwrap_or_else(|_| "2000".to_string())
                        .parse()?,
                ),
                min_max_delay: Duration::from_millis(
                    env::var("OPC_MIN_MAX_DELAY_MS")
                        .unwrap_or_else(|_| "10000".to_string())
                        .parse()?,
                ),
            },
            subscription: SubscriptionDefaults::default(),
            monitored_item: MonitoredItemDefaults::default(),
            batching: BatchingConfig {
                window: Duration::from_millis(
                    env::var("BATCH_WINDOW_MS")
                        .unwrap_or_else(|_| "100".to_string())
                        .parse()?,
                ),
                trans_id_margin: env::var("BATCH_TRANS_ID_MARGIN")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_delay_uses_device_timeout_when_larger() {
        let defaults = ConnectionDefaults::default();
        assert_eq!(
            defaults.max_delay_for(Duration::from_millis(30_000)),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            defaults.max_delay_for(Duration::from_millis(500)),
            Duration::from_millis(10_000)
        );
    }
}
