//! Protocol error codes and the per-message error type.
//!
//! [`ErrorCode`] is the machine-readable `code` field of every `error`
//! message the authority sends. [`ProtocolError`] is what validation returns
//! for a single bad message; it never implies the connection should close.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire error codes carried in `error` messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Serialized message exceeds the maximum size.
    MessageTooLarge,
    /// Message is not a parseable envelope.
    InvalidMessage,
    /// Sender exceeded its rate limit; message dropped.
    RateLimited,
    /// `type` is not in the known catalog, or not accepted from clients.
    UnknownType,
    /// `data` does not have the shape the message type requires.
    InvalidPayload,
    /// Routing failed inside the authority.
    InternalError,
    /// The upload pipeline refused a cancellation.
    CancellationFailed,
    /// Credential rejected at handshake.
    AuthFailed,
    /// Authority is at its global connection cap.
    CapacityExceeded,
}

impl ErrorCode {
    /// Wire representation (e.g. `"RATE_LIMITED"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::InternalError => "INTERNAL_ERROR",
            Self::CancellationFailed => "CANCELLATION_FAILED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message failed size, parse, type, or shape validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Serialized size exceeds the limit.
    #[error("message size {size} exceeds maximum of {max} bytes")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Not valid JSON, or not an envelope object.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// `type` tag not in the catalog.
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// Known type that only flows server → client.
    #[error("message type '{0}' cannot be sent by clients")]
    NotClientType(String),

    /// Known type whose `data` is missing required fields.
    #[error("invalid payload for '{kind}': {reason}")]
    InvalidPayload {
        /// Message type tag.
        kind: String,
        /// What was wrong.
        reason: String,
    },
}

impl ProtocolError {
    /// The wire code reported back to the sender.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TooLarge { .. } => ErrorCode::MessageTooLarge,
            Self::Malformed(_) => ErrorCode::InvalidMessage,
            Self::UnknownType(_) | Self::NotClientType(_) => ErrorCode::UnknownType,
            Self::InvalidPayload { .. } => ErrorCode::InvalidPayload,
        }
    }
}
