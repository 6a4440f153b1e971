//! # pulse-server
//!
//! The Connection Authority and its Axum surface.
//!
//! - **Authority**: token admission, per-identity and global caps with
//!   oldest-first eviction, per-message validation, rate limiting, routing,
//!   and a single idempotent disconnect path
//! - **Fan-out**: per-identity send, subscriber broadcast, and authority-wide
//!   broadcast with delivered counts
//! - **Sweeper**: closes connections that stop heartbeating
//! - **HTTP**: `/ws/{token}` upgrade, `/health`, `/metrics`, and admin routes
//! - Graceful shutdown via `CancellationToken` (close code 1001)

#![deny(unsafe_code)]

pub mod admin;
pub mod authority;
pub mod canceller;
pub mod config;
pub mod connection;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod sweeper;
pub mod websocket;

pub use authority::{ConnectionAuthority, DisconnectReason};
pub use canceller::{NoUploadPipeline, UploadCanceller};
pub use config::ServerConfig;
pub use errors::{AdmissionError, ServerError};
pub use server::PulseServer;
