//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`,
//! so a partial file only overrides what it names.

mod agent;
mod auth;
mod logging;
mod server;

pub use agent::*;
pub use auth::*;
pub use logging::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for both the authority and the agent.
///
/// ```json
/// {
///   "server": { "port": 9000, "perUserLimit": 5 },
///   "agent": { "url": "ws://pulse.internal:9000" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseSettings {
    /// Authority settings.
    pub server: ServerSettings,
    /// Handshake credential settings.
    pub auth: AuthSettings,
    /// Agent settings.
    pub agent: AgentSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl PulseSettings {
    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.max_connections == 0 {
            return Err(invalid("server.maxConnections must be at least 1"));
        }
        if s.per_user_limit == 0 {
            return Err(invalid("server.perUserLimit must be at least 1"));
        }
        if s.rate_limit_messages == 0 || s.rate_limit_window_ms == 0 {
            return Err(invalid("server rate limit must admit at least one message"));
        }
        if s.heartbeat_timeout_ms <= s.heartbeat_interval_ms {
            return Err(invalid(
                "server.heartbeatTimeoutMs must exceed server.heartbeatIntervalMs",
            ));
        }
        if s.send_queue_capacity == 0 {
            return Err(invalid("server.sendQueueCapacity must be at least 1"));
        }
        let a = &self.agent;
        if a.base_delay_ms > a.max_delay_ms {
            return Err(invalid("agent.baseDelayMs must not exceed agent.maxDelayMs"));
        }
        if a.queue_enabled && a.queue_capacity == 0 {
            return Err(invalid("agent.queueCapacity must be at least 1 when queueing"));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(invalid("auth.jwtSecret must not be empty"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}
