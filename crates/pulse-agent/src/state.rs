//! Agent-visible state, notices, and send outcomes.

use std::fmt;
use std::time::Duration;

use pulse_core::ErrorCode;
use serde::{Deserialize, Serialize};

/// Connection state of an agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Idle; nothing scheduled.
    #[default]
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Handshake complete; traffic flows.
    Connected,
    /// Waiting for the backoff timer.
    Reconnecting,
    /// Gave up (attempt ceiling or unrecoverable fault).
    Error,
    /// Connected but outbound traffic is paused until the window clears.
    RateLimited,
    /// The authority refused the credential; waits for a refresh.
    AuthenticationFailed,
}

impl ConnectionState {
    /// Wire/log name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::RateLimited => "rate_limited",
            Self::AuthenticationFailed => "authentication_failed",
        }
    }

    /// Whether a socket is open.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::RateLimited)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an outbound message was not sent or queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The local rate window is full.
    RateLimited,
    /// Not connected and queueing is disabled.
    QueueDisabled,
    /// The socket went away between the state check and the write.
    NotConnected,
}

/// Result of [`crate::ConnectionAgent::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the socket.
    Sent,
    /// Held in the outbound queue.
    Queued,
    /// Discarded.
    Dropped(DropReason),
}

/// Out-of-band events observers may want to react to.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentNotice {
    /// A ping went unanswered for the pong timeout. The connection stays up.
    PongTimeout {
        /// Correlation id of the unanswered ping.
        correlation_id: String,
    },
    /// Outbound traffic is paused.
    RateLimited {
        /// Time until the window clears.
        retry_after: Duration,
    },
    /// A reconnect is scheduled.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The attempt ceiling was reached.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The authority refused the credential.
    AuthenticationFailed {
        /// Close reason or HTTP status.
        reason: String,
    },
    /// The authority reported an error for one of our messages.
    ServerError {
        /// Error code.
        code: ErrorCode,
        /// Error message.
        message: String,
    },
    /// The queue was full and its oldest entry was dropped.
    QueueOverflow,
}
