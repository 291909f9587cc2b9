//! Cluster transport and membership settings

use crate::defaults;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for pools, node loops, the membership watch and the listener
///
/// Durations are stored as milliseconds so they read naturally in TOML and
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub pool_size: usize,
    pub dial_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub monitor_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub watch_wait_ms: u64,
    pub watch_retry_delay_ms: u64,
    pub listener_initial_timeout_ms: u64,
    pub listener_idle_timeout_ms: u64,
    pub max_frame_size: usize,
    pub event_capacity: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            pool_size: defaults::pool::SIZE,
            dial_timeout_ms: defaults::pool::DIAL_TIMEOUT_MS,
            heartbeat_interval_ms: defaults::node::HEARTBEAT_INTERVAL_MS,
            monitor_interval_ms: defaults::node::MONITOR_INTERVAL_MS,
            reconnect_delay_ms: defaults::node::RECONNECT_DELAY_MS,
            watch_wait_ms: defaults::watch::WAIT_MS,
            watch_retry_delay_ms: defaults::watch::RETRY_DELAY_MS,
            listener_initial_timeout_ms: defaults::listener::INITIAL_TIMEOUT_MS,
            listener_idle_timeout_ms: defaults::listener::IDLE_TIMEOUT_MS,
            max_frame_size: defaults::listener::MAX_FRAME_SIZE,
            event_capacity: defaults::watch::EVENT_CAPACITY,
        }
    }
}

impl ClusterSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn watch_wait(&self) -> Duration {
        Duration::from_millis(self.watch_wait_ms)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }

    pub fn listener_initial_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_initial_timeout_ms)
    }

    pub fn listener_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_idle_timeout_ms)
    }

    /// Reject values that would stall a loop or make a pool unusable
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("watch_wait_ms", self.watch_wait_ms),
            ("watch_retry_delay_ms", self.watch_retry_delay_ms),
            ("listener_initial_timeout_ms", self.listener_initial_timeout_ms),
            ("listener_idle_timeout_ms", self.listener_idle_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.pool_size == 0 {
            bail!("pool_size must be greater than zero");
        }
        if self.max_frame_size == 0 {
            bail!("max_frame_size must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ClusterSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pool_size, 4);
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(settings.listener_idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let settings = ClusterSettings {
            monitor_interval_ms: 0,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("monitor_interval_ms"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings: ClusterSettings = toml::from_str("pool_size = 2").unwrap();
        assert_eq!(settings.pool_size, 2);
        assert_eq!(settings.reconnect_delay_ms, 5_000);
    }
}
