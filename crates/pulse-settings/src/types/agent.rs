//! Client-side agent settings.

use std::time::Duration;

use pulse_core::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Connection Agent settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Base URL of the authority (`ws://host:port`).
    pub url: String,
    /// Reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,
    /// First reconnect delay in milliseconds.
    pub base_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub jitter_ms: u64,
    /// Scheduled retries allowed before giving up.
    pub max_reconnect_attempts: u32,
    /// Handshake deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// Ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a matching pong.
    pub pong_timeout_ms: u64,
    /// Queue outbound messages while not connected.
    pub queue_enabled: bool,
    /// Outbound queue capacity (oldest dropped when full).
    pub queue_capacity: usize,
    /// Rolling latency samples kept.
    pub latency_samples: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            url: "ws://127.0.0.1:8090".to_string(),
            auto_reconnect: true,
            base_delay_ms: backoff.base_delay_ms,
            max_delay_ms: backoff.max_delay_ms,
            jitter_ms: backoff.jitter_ms,
            max_reconnect_attempts: 10,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            queue_enabled: true,
            queue_capacity: 100,
            latency_samples: 20,
        }
    }
}

impl AgentSettings {
    /// Backoff policy built from the delay fields.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_ms: self.jitter_ms,
        }
    }

    /// Handshake deadline as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
