//! Authority error types.

use pulse_auth::AuthError;
use pulse_core::ErrorCode;
use pulse_core::close;
use thiserror::Error;

/// Why a handshake was refused.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Token invalid, expired, or the account is inactive.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The authority is at its global connection cap.
    #[error("server at capacity ({max} connections)")]
    Capacity {
        /// Configured global cap.
        max: usize,
    },
}

impl AdmissionError {
    /// WebSocket close code sent with the refusal.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Authentication(_) => close::AUTH_FAILED,
            Self::Capacity { .. } => close::TRY_AGAIN_LATER,
        }
    }

    /// Wire error code sent before the close frame.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Authentication(_) => ErrorCode::AuthFailed,
            Self::Capacity { .. } => ErrorCode::CapacityExceeded,
        }
    }
}

/// A validated message could not be routed.
#[derive(Debug, Error)]
pub enum RouteError {
    /// `data` passed shape checks but did not decode.
    #[error("payload did not decode: {0}")]
    Payload(#[from] serde_json::Error),

    /// The upload pipeline refused the cancellation.
    #[error("upload cancellation failed: {0}")]
    Cancellation(String),

    /// No route for this type.
    #[error("no route for message type '{0}'")]
    Unroutable(String),
}

impl RouteError {
    /// Wire error code reported to the sender.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Payload(_) => ErrorCode::InvalidPayload,
            Self::Cancellation(_) => ErrorCode::CancellationFailed,
            Self::Unroutable(_) => ErrorCode::UnknownType,
        }
    }
}

/// An outbound message could not be queued for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The bounded outbound queue is full (peer is not draining).
    #[error("outbound queue full")]
    Full,
    /// The writer task is gone.
    #[error("connection closed")]
    Closed,
}

/// Errors starting or running the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The Prometheus recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_close_codes() {
        let auth = AdmissionError::from(AuthError::Expired);
        assert_eq!(auth.close_code(), 4001);
        assert_eq!(auth.error_code(), ErrorCode::AuthFailed);

        let cap = AdmissionError::Capacity { max: 1000 };
        assert_eq!(cap.close_code(), 1013);
        assert_eq!(cap.error_code(), ErrorCode::CapacityExceeded);
        assert!(cap.to_string().contains("1000"));
    }

    #[test]
    fn route_error_codes() {
        assert_eq!(
            RouteError::Cancellation("gone".into()).code(),
            ErrorCode::CancellationFailed
        );
        assert_eq!(
            RouteError::Unroutable("pong".into()).code(),
            ErrorCode::UnknownType
        );
    }
}
