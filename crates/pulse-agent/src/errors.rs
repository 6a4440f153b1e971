//! Agent error types.

use pulse_auth::AuthError;
use pulse_core::ProtocolError;
use thiserror::Error;

/// Errors surfaced by [`crate::ConnectionAgent`].
#[derive(Debug, Error)]
pub enum AgentError {
    /// The outbound message failed local validation.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ProtocolError),

    /// The credential source could not produce a token.
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] AuthError),

    /// The authority rejected the credential (HTTP 401/403 or close 4001).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No `connection.established` within the handshake deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The socket closed or failed before or during the handshake.
    #[error("transport error: {0}")]
    Transport(String),

    /// The handshake produced something other than `connection.established`.
    #[error("unexpected handshake reply: {0}")]
    Handshake(String),

    /// The authority refused the connection with a close frame.
    #[error("closed by server ({code}): {reason}")]
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// The agent stopped before the attempt finished.
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) if is_auth_rejection(response.status().as_u16()) => {
                Self::AuthenticationFailed(format!("HTTP {}", response.status()))
            }
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Whether an HTTP status on the upgrade request means the credential was
/// refused.
pub fn is_auth_rejection(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn upgrade_statuses() {
        assert!(is_auth_rejection(401));
        assert!(is_auth_rejection(403));
        assert!(!is_auth_rejection(500));
        assert!(!is_auth_rejection(404));
    }

    #[test]
    fn other_transport_errors_are_retryable() {
        let err = AgentError::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert_matches!(err, AgentError::Transport(_));
    }

    #[test]
    fn closed_display_includes_code() {
        let err = AgentError::Closed {
            code: 1013,
            reason: "server at capacity".into(),
        };
        assert!(err.to_string().contains("1013"));
    }
}
