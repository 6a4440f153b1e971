//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Connections admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Handshakes refused (counter, labels: reason).
pub const WS_ADMISSIONS_REJECTED_TOTAL: &str = "ws_admissions_rejected_total";
/// Disconnections (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Accepted inbound messages (counter, labels: type).
pub const WS_MESSAGES_TOTAL: &str = "ws_messages_total";
/// Error replies (counter, labels: code).
pub const WS_MESSAGE_ERRORS_TOTAL: &str = "ws_message_errors_total";
/// Messages delivered by fan-out (counter).
pub const WS_BROADCAST_DELIVERED_TOTAL: &str = "ws_broadcast_delivered_total";
/// Connections replaced by a newer one (counter).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Sweeper passes (counter).
pub const WS_SWEEPS_TOTAL: &str = "ws_sweeps_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
