//! # pulse-core
//!
//! Shared vocabulary for both ends of a Pulse connection.
//!
//! - **Envelope**: [`envelope::Envelope`] with the `type`/`data`/`timestamp`/`id`
//!   wire shape, plus the [`envelope::MessageType`] and
//!   [`envelope::EventCategory`] catalogs
//! - **Validation**: size, parse, and per-type shape rules shared by the
//!   authority and the agent
//! - **Close codes**: WebSocket close codes used for admission and teardown
//! - **Sliding window**: the per-identity rate-limit counter
//! - **Backoff**: reconnect delay with exponential growth and jitter
//! - **Branded IDs**: `ConnectionId`, `MessageId`
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod backoff;
pub mod close;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod validation;
pub mod window;

pub use envelope::{Envelope, EventCategory, MessageType, ServerLimits};
pub use errors::{ErrorCode, ProtocolError};
pub use ids::{ConnectionId, MessageId};
pub use window::SlidingWindow;

/// Maximum serialized size of one message (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
