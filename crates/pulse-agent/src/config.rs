//! Agent configuration.

use std::time::Duration;

use pulse_core::ServerLimits;
use pulse_core::backoff::BackoffPolicy;
use pulse_settings::AgentSettings;

/// Runtime configuration for a [`crate::ConnectionAgent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    /// Base URL of the authority (`ws://host:port`); `/ws/{token}` is appended.
    pub url: String,
    /// Reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,
    /// Reconnect delay parameters.
    pub backoff: BackoffPolicy,
    /// Scheduled retries allowed before entering `error`.
    pub max_reconnect_attempts: u32,
    /// Deadline for `connection.established`.
    pub connect_timeout: Duration,
    /// Ping interval used until the authority publishes its own.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered before a notice is raised.
    pub pong_timeout: Duration,
    /// Queue outbound messages while not connected.
    pub queue_enabled: bool,
    /// Outbound queue capacity; the oldest entry is dropped when full.
    pub queue_capacity: usize,
    /// Rolling latency samples kept.
    pub latency_samples: usize,
    /// Limits assumed before the first handshake.
    pub initial_limits: ServerLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for AgentConfig {
    fn from(s: &AgentSettings) -> Self {
        Self {
            url: s.url.clone(),
            auto_reconnect: s.auto_reconnect,
            backoff: s.backoff(),
            max_reconnect_attempts: s.max_reconnect_attempts,
            connect_timeout: s.connect_timeout(),
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(s.pong_timeout_ms),
            queue_enabled: s.queue_enabled,
            queue_capacity: s.queue_capacity,
            latency_samples: s.latency_samples,
            initial_limits: ServerLimits::default(),
        }
    }
}

impl AgentConfig {
    /// Config pointing at `url` with every other field defaulted.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Handshake URL for `token`.
    pub fn endpoint(&self, token: &str) -> String {
        format!("{}/ws/{token}", self.url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = AgentConfig::default();
        assert!(cfg.auto_reconnect);
        assert_eq!(cfg.backoff.base_delay_ms, 500);
        assert_eq!(cfg.backoff.max_delay_ms, 30_000);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.queue_capacity, 100);
        assert_eq!(cfg.initial_limits.max_message_size, 65_536);
    }

    #[test]
    fn endpoint_appends_token() {
        let cfg = AgentConfig::for_url("ws://localhost:8090/");
        assert_eq!(cfg.endpoint("abc"), "ws://localhost:8090/ws/abc");
    }
}
