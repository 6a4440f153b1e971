//! Server configuration.

use std::time::Duration;

use pulse_core::ServerLimits;
use pulse_settings::ServerSettings;

/// Floor for the transport frame limit. Anything under it reaches dispatch,
/// where oversized payloads get `MESSAGE_TOO_LARGE` and the socket stays open.
pub const TRANSPORT_FRAME_LIMIT: usize = 16 * 1024 * 1024;

/// Runtime configuration for the authority and its HTTP surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks one).
    pub port: u16,
    /// Global connection cap.
    pub max_connections: usize,
    /// Per-identity connection cap.
    pub per_user_limit: usize,
    /// Limits advertised to clients and enforced on inbound traffic.
    pub limits: ServerLimits,
    /// Silence after which the sweeper closes a connection.
    pub heartbeat_timeout: Duration,
    /// Sweeper period.
    pub sweep_interval: Duration,
    /// Bounded outbound queue per connection.
    pub send_queue_capacity: usize,
    /// How long shutdown waits for background tasks.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from(&ServerSettings::default())
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            per_user_limit: s.per_user_limit,
            limits: s.limits(),
            heartbeat_timeout: s.heartbeat_timeout(),
            sweep_interval: s.sweep_interval(),
            send_queue_capacity: s.send_queue_capacity,
            shutdown_grace: s.shutdown_grace(),
        }
    }
}

impl ServerConfig {
    /// Rate-limit capacity as a window size.
    pub fn rate_limit_max(&self) -> usize {
        usize::try_from(self.limits.rate_limit_messages).unwrap_or(usize::MAX)
    }

    /// Largest frame the transport accepts. Frames between
    /// `max_message_size` and this reach dispatch and get a
    /// `MESSAGE_TOO_LARGE` reply instead of a dropped socket.
    pub fn transport_frame_limit(&self) -> usize {
        self.limits.max_message_size.max(TRANSPORT_FRAME_LIMIT)
    }
}
