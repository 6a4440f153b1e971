//! Authority-side settings: listener, caps, limits, and timers.

use std::time::Duration;

use pulse_core::ServerLimits;
use serde::{Deserialize, Serialize};

/// Connection Authority settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// Global cap on live connections.
    pub max_connections: usize,
    /// Live connections allowed per identity before the oldest is evicted.
    pub per_user_limit: usize,
    /// Maximum serialized message size in bytes.
    pub max_message_size: usize,
    /// Messages allowed per identity per rate window.
    pub rate_limit_messages: u32,
    /// Rate window length in milliseconds.
    pub rate_limit_window_ms: u64,
    /// Heartbeat interval published to clients, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// A connection silent for longer than this is swept.
    pub heartbeat_timeout_ms: u64,
    /// How often the stale sweeper runs.
    pub sweep_interval_ms: u64,
    /// Bounded outbound queue per connection.
    pub send_queue_capacity: usize,
    /// How long shutdown waits for connections to drain.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            max_connections: 1000,
            per_user_limit: 3,
            max_message_size: pulse_core::MAX_MESSAGE_SIZE,
            rate_limit_messages: 100,
            rate_limit_window_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            sweep_interval_ms: 30_000,
            send_queue_capacity: 256,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// Limits advertised in `connection.established`.
    pub fn limits(&self) -> ServerLimits {
        ServerLimits {
            max_message_size: self.max_message_size,
            rate_limit_messages: self.rate_limit_messages,
            rate_limit_window_ms: self.rate_limit_window_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        }
    }

    /// Heartbeat timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
