//! # pulse-agent
//!
//! The Connection Agent: the client end of a Pulse connection.
//!
//! - **State machine**: `disconnected → connecting → connected`, with
//!   `reconnecting`, `rate_limited`, `authentication_failed`, and `error`
//! - **Reconnect**: capped exponential backoff with jitter and an attempt
//!   ceiling
//! - **Heartbeat**: correlated `ping`/`pong` with a pong timeout notice and
//!   rolling round-trip samples
//! - **Outbound**: local validation, a drop-oldest offline queue flushed in
//!   order on reconnect, and a sliding window sized from the authority's
//!   published limits
//! - **Inbound**: per-type handlers and resubscription after reconnect

#![deny(unsafe_code)]

pub mod agent;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod latency;
pub mod queue;
pub mod state;

pub use agent::{AgentStats, ConnectionAgent};
pub use config::AgentConfig;
pub use errors::{AgentError, Result};
pub use handlers::{Handler, HandlerId, HandlerRegistry};
pub use state::{AgentNotice, ConnectionState, DropReason, SendOutcome};
