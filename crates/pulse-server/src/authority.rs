//! Connection Authority: admission, per-message dispatch, disconnect, and
//! fan-out.
//!
//! Every path that ends a connection goes through [`ConnectionAuthority::disconnect`],
//! which removes it from the registry first. Only the caller that actually
//! removed the connection performs teardown, so eviction, sweeping, send
//! failure, and the client closing can race without double-freeing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant as StdInstant;

use chrono::Utc;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use pulse_auth::CredentialValidator;
use pulse_core::envelope::{
    ConnectionEstablished, ErrorPayload, PingPayload, PongPayload, SubscriptionAck,
    SubscriptionAction, SubscriptionRequest, UploadCancelRequest,
};
use pulse_core::validation::{check_size, parse_raw, validate_client_message, validate_outbound};
use pulse_core::{Envelope, ErrorCode, EventCategory, MessageType, close};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::canceller::UploadCanceller;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::errors::{AdmissionError, RouteError};
use crate::metrics as m;
use crate::rate_limit::RateLimiter;
use crate::registry::{Admission, ConnectionRegistry};

/// Why a connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket.
    ClientClosed,
    /// The transport failed.
    TransportError,
    /// A newer connection from the same identity replaced it.
    Evicted,
    /// No liveness signal within the timeout.
    HeartbeatTimeout,
    /// The outbound queue was full or closed.
    SendFailed,
    /// The server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Metric label and log value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::Evicted => "evicted",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SendFailed => "send_failed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Close code sent to the client.
    pub fn close_code(self) -> u16 {
        match self {
            Self::ClientClosed | Self::TransportError => close::NORMAL,
            Self::Evicted => close::EVICTED,
            Self::HeartbeatTimeout => close::HEARTBEAT_TIMEOUT,
            Self::SendFailed => close::SEND_FAILED,
            Self::Shutdown => close::GOING_AWAY,
        }
    }

    /// Close reason text sent to the client.
    pub fn close_text(self) -> &'static str {
        match self {
            Self::ClientClosed | Self::TransportError => "",
            Self::Evicted => "superseded by newer connection",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::SendFailed => "send failed",
            Self::Shutdown => "server shutting down",
        }
    }
}

/// Aggregate counters for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct AuthorityStats {
    /// Live connections.
    pub connections: usize,
    /// Identities with at least one live connection.
    pub identities: usize,
    /// Global cap.
    pub max_connections: usize,
    /// Per-identity cap.
    pub per_user_limit: usize,
    /// Connections admitted since start.
    pub total_admitted: u64,
    /// Handshakes refused since start.
    pub total_rejected: u64,
    /// Evictions since start.
    pub total_evicted: u64,
    /// Connections swept for missing heartbeats since start.
    pub total_swept: u64,
    /// Inbound messages accepted by live connections.
    pub messages_received: u64,
    /// Outbound messages queued to live connections.
    pub messages_sent: u64,
    /// Seconds since the authority was created.
    pub uptime_secs: u64,
}

/// One connection's metadata for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub connection_id: String,
    /// Owning identity.
    pub user_id: String,
    /// Wall-clock admission time.
    pub created_at: chrono::DateTime<Utc>,
    /// Seconds since admission.
    pub connected_secs: u64,
    /// Seconds since any inbound activity.
    pub idle_secs: u64,
    /// Seconds since the last liveness signal.
    pub since_heartbeat_secs: u64,
    /// Subscribed categories.
    pub subscriptions: Vec<EventCategory>,
    /// Accepted inbound messages.
    pub messages_received: u64,
    /// Outbound messages queued.
    pub messages_sent: u64,
    /// Errors reported.
    pub errors: u64,
    /// Outbound messages dropped.
    pub dropped: u64,
}

#[derive(Default)]
struct Totals {
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    swept: AtomicU64,
}

/// The server-side owner of every live connection.
pub struct ConnectionAuthority {
    config: ServerConfig,
    registry: ConnectionRegistry,
    rate_limiter: RateLimiter,
    validator: Arc<dyn CredentialValidator>,
    canceller: Arc<dyn UploadCanceller>,
    totals: Totals,
    started_at: StdInstant,
}

impl ConnectionAuthority {
    /// Build an authority.
    pub fn new(
        config: ServerConfig,
        validator: Arc<dyn CredentialValidator>,
        canceller: Arc<dyn UploadCanceller>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.max_connections, config.per_user_limit),
            rate_limiter: RateLimiter::new(config.rate_limit_max(), config.limits.rate_window()),
            config,
            validator,
            canceller,
            totals: Totals::default(),
            started_at: StdInstant::now(),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Credential validator (shared with the admin surface).
    pub fn validator(&self) -> &Arc<dyn CredentialValidator> {
        &self.validator
    }

    /// Registry of live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Authenticate `token` and register a new connection.
    ///
    /// On success the returned receiver carries the connection's outbound
    /// text; `connection.established` is already queued on it.
    #[instrument(skip_all)]
    pub async fn admit(
        &self,
        token: &str,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Arc<str>>), AdmissionError> {
        let identity = match self.validator.validate(token).await {
            Ok(identity) => identity,
            Err(err) => {
                self.record_rejection("auth");
                debug!(error = %err, "handshake rejected");
                return Err(err.into());
            }
        };

        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity.max(1));
        let conn = Arc::new(Connection::new(identity.user_id, tx));

        // Queued before the registry publishes the connection, so no
        // broadcast can overtake it.
        let established = ConnectionEstablished {
            connection_id: conn.id.to_string(),
            user_id: conn.user_id.clone(),
            server_time: Utc::now(),
            limits: self.config.limits,
        };
        match Envelope::from_payload(MessageType::ConnectionEstablished, &established) {
            Ok(envelope) => {
                if let Some(text) = self.serialize(&envelope) {
                    let _ = conn.send(text);
                }
            }
            Err(err) => error!(error = %err, "failed to build connection.established"),
        }

        match self.registry.admit(Arc::clone(&conn)) {
            Admission::AtCapacity => {
                self.record_rejection("capacity");
                warn!(
                    user_id = %conn.user_id,
                    max = self.config.max_connections,
                    "connection refused: server at capacity"
                );
                return Err(AdmissionError::Capacity {
                    max: self.config.max_connections,
                });
            }
            Admission::Admitted { evicted } => {
                if let Some(old) = evicted {
                    let _ = self.totals.evicted.fetch_add(1, Ordering::Relaxed);
                    counter!(m::WS_EVICTIONS_TOTAL).increment(1);
                    info!(
                        user_id = %old.user_id,
                        conn_id = %old.id,
                        replaced_by = %conn.id,
                        "evicting oldest connection"
                    );
                    self.teardown(&old, DisconnectReason::Evicted);
                }
            }
        }

        let _ = self.totals.admitted.fetch_add(1, Ordering::Relaxed);
        counter!(m::WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(m::WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(conn_id = %conn.id, user_id = %conn.user_id, "connection admitted");

        Ok((conn, rx))
    }

    fn record_rejection(&self, reason: &'static str) {
        let _ = self.totals.rejected.fetch_add(1, Ordering::Relaxed);
        counter!(m::WS_ADMISSIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Handle one inbound frame from connection `id`.
    ///
    /// Validation failures and routing failures produce an `error` reply;
    /// none of them end the connection.
    #[instrument(skip_all, fields(conn_id = %id))]
    pub async fn dispatch(&self, id: &str, bytes: &[u8]) {
        let Some(conn) = self.registry.get(id) else {
            debug!("dispatch for unknown connection");
            return;
        };

        if let Err(err) = check_size(bytes.len(), self.config.limits.max_message_size) {
            self.reply_error(&conn, ErrorPayload::from(&err));
            return;
        }

        let raw = match parse_raw(bytes) {
            Ok(raw) => raw,
            Err(err) => {
                self.reply_error(&conn, ErrorPayload::from(&err));
                return;
            }
        };

        if !self.rate_limiter.allow(&conn.user_id) {
            let retry_after = self.rate_limiter.retry_after(&conn.user_id);
            let mut payload = ErrorPayload::new(ErrorCode::RateLimited, "rate limit exceeded");
            payload.retry_after_ms =
                Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
            payload.reset_at = chrono::Duration::from_std(retry_after)
                .ok()
                .map(|d| Utc::now() + d);
            payload.message_id = raw.id.clone();
            debug!(user_id = %conn.user_id, "message dropped: rate limited");
            self.reply_error(&conn, payload);
            return;
        }

        let message_id = raw.id.clone();
        let envelope = match validate_client_message(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                let mut payload = ErrorPayload::from(&err);
                payload.message_id = message_id;
                self.reply_error(&conn, payload);
                return;
            }
        };

        conn.touch();
        conn.record_received();
        counter!(m::WS_MESSAGES_TOTAL, "type" => envelope.kind.as_str()).increment(1);

        let kind = envelope.kind;
        let envelope_id = envelope.id.to_string();
        let routed = AssertUnwindSafe(self.route(&conn, envelope))
            .catch_unwind()
            .await;
        match routed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(r#type = kind.as_str(), error = %err, "routing failed");
                self.reply_error(
                    &conn,
                    ErrorPayload::new(err.code(), err.to_string()).with_message_id(envelope_id),
                );
            }
            Err(_) => {
                error!(r#type = kind.as_str(), "routing panicked");
                self.reply_error(
                    &conn,
                    ErrorPayload::new(ErrorCode::InternalError, "internal error")
                        .with_message_id(envelope_id),
                );
            }
        }
    }

    async fn route(&self, conn: &Arc<Connection>, envelope: Envelope) -> Result<(), RouteError> {
        match envelope.kind {
            MessageType::Ping => {
                let ping: PingPayload = envelope.payload()?;
                conn.touch_heartbeat();
                let pong = PongPayload {
                    correlation_id: ping.correlation_id,
                    server_time: Utc::now(),
                };
                let envelope = Envelope::from_payload(MessageType::Pong, &pong)?;
                let _ = self.send_envelope(conn, &envelope);
                Ok(())
            }
            MessageType::Heartbeat => {
                conn.touch_heartbeat();
                Ok(())
            }
            MessageType::Subscribe | MessageType::Unsubscribe => {
                let request: SubscriptionRequest = envelope.payload()?;
                let (events, rejected) = partition_categories(request.events);
                let (action, subscriptions) = if envelope.kind == MessageType::Subscribe {
                    (SubscriptionAction::Subscribe, conn.subscribe(&events))
                } else {
                    (SubscriptionAction::Unsubscribe, conn.unsubscribe(&events))
                };
                if !rejected.is_empty() {
                    debug!(?rejected, "ignoring unrecognized categories");
                }
                let ack = SubscriptionAck {
                    action,
                    events,
                    rejected,
                    subscriptions,
                };
                let _ = self.send_envelope(
                    conn,
                    &Envelope::from_payload(MessageType::SubscriptionAcknowledged, &ack)?,
                );
                Ok(())
            }
            MessageType::UploadCancel => {
                let request: UploadCancelRequest = envelope.payload()?;
                self.canceller
                    .cancel(&conn.user_id, &request.upload_id)
                    .await
                    .map_err(RouteError::Cancellation)?;
                info!(upload_id = %request.upload_id, "upload cancellation forwarded");
                Ok(())
            }
            other => Err(RouteError::Unroutable(other.as_str().to_owned())),
        }
    }

    fn reply_error(&self, conn: &Arc<Connection>, payload: ErrorPayload) {
        conn.record_error();
        counter!(m::WS_MESSAGE_ERRORS_TOTAL, "code" => payload.code.as_str()).increment(1);
        let _ = self.send_envelope(conn, &Envelope::error(&payload));
    }

    // ── Disconnect ──────────────────────────────────────────────────

    /// End a connection. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: &str, reason: DisconnectReason) -> bool {
        let Some(conn) = self.registry.remove(id) else {
            debug!(conn_id = %id, reason = reason.as_str(), "already disconnected");
            return false;
        };
        if reason == DisconnectReason::HeartbeatTimeout {
            let _ = self.totals.swept.fetch_add(1, Ordering::Relaxed);
        }
        self.teardown(&conn, reason);
        true
    }

    /// Close every live connection. Returns how many were closed.
    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|conn| self.disconnect(&conn.id, reason))
            .count()
    }

    // Runs once per connection, after it left the registry.
    fn teardown(&self, conn: &Connection, reason: DisconnectReason) {
        conn.close(reason.close_code(), reason.close_text());
        counter!(m::WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(m::WS_CONNECTIONS_ACTIVE).decrement(1.0);
        let lifetime = Instant::now().saturating_duration_since(conn.connected_at);
        histogram!(m::WS_CONNECTION_DURATION_SECONDS).record(lifetime.as_secs_f64());
        info!(
            conn_id = %conn.id,
            user_id = %conn.user_id,
            reason = reason.as_str(),
            received = conn.messages_received(),
            sent = conn.messages_sent(),
            "connection closed"
        );
    }

    // ── Outbound ────────────────────────────────────────────────────

    fn send_envelope(&self, conn: &Arc<Connection>, envelope: &Envelope) -> bool {
        match validate_outbound(envelope, self.config.limits.max_message_size) {
            Ok(text) => self.deliver(conn, Arc::from(text)),
            Err(err) => {
                warn!(
                    conn_id = %conn.id,
                    r#type = envelope.kind.as_str(),
                    error = %err,
                    "outbound message rejected"
                );
                false
            }
        }
    }

    fn deliver(&self, conn: &Arc<Connection>, text: Arc<str>) -> bool {
        match conn.send(text) {
            Ok(()) => true,
            Err(err) => {
                warn!(conn_id = %conn.id, error = %err, "send failed, disconnecting");
                let _ = self.disconnect(&conn.id, DisconnectReason::SendFailed);
                false
            }
        }
    }

    fn serialize(&self, envelope: &Envelope) -> Option<Arc<str>> {
        match validate_outbound(envelope, self.config.limits.max_message_size) {
            Ok(text) => Some(Arc::from(text)),
            Err(err) => {
                warn!(r#type = envelope.kind.as_str(), error = %err, "broadcast rejected");
                None
            }
        }
    }

    fn fan_out<'a>(
        &self,
        targets: impl Iterator<Item = &'a Arc<Connection>>,
        text: &Arc<str>,
    ) -> usize {
        let delivered = targets
            .filter(|conn| self.deliver(conn, Arc::clone(text)))
            .count();
        counter!(m::WS_BROADCAST_DELIVERED_TOTAL).increment(delivered as u64);
        delivered
    }

    /// Send an envelope to one connection. A failed send disconnects it.
    pub fn send_to_connection(&self, id: &str, envelope: &Envelope) -> bool {
        self.registry
            .get(id)
            .is_some_and(|conn| self.send_envelope(&conn, envelope))
    }

    /// Send to every connection of `user_id`. Returns the delivered count.
    pub fn send_to_identity(
        &self,
        user_id: &str,
        kind: impl Into<MessageType>,
        data: Value,
    ) -> usize {
        let Some(text) = self.serialize(&Envelope::new(kind, data)) else {
            return 0;
        };
        let targets = self.registry.connections_for(user_id);
        self.fan_out(targets.iter(), &text)
    }

    /// Push a `category` event to every subscribed connection. Returns the
    /// delivered count.
    pub fn broadcast_to_subscribers(&self, category: EventCategory, data: Value) -> usize {
        self.broadcast_envelope(&Envelope::new(category, data), Some(category))
    }

    /// Send to every live connection. Returns the delivered count.
    pub fn broadcast_all(&self, kind: impl Into<MessageType>, data: Value) -> usize {
        self.broadcast_envelope(&Envelope::new(kind, data), None)
    }

    /// Send `envelope` to every live connection, or only to subscribers of
    /// `category` when given.
    pub fn broadcast_envelope(
        &self,
        envelope: &Envelope,
        category: Option<EventCategory>,
    ) -> usize {
        let Some(text) = self.serialize(envelope) else {
            return 0;
        };
        let snapshot = self.registry.snapshot();
        let targets = snapshot
            .iter()
            .filter(|conn| category.is_none_or(|c| conn.is_subscribed(c)));
        let delivered = self.fan_out(targets, &text);
        debug!(r#type = envelope.kind.as_str(), delivered, "broadcast");
        delivered
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Aggregate statistics.
    pub fn stats(&self) -> AuthorityStats {
        let snapshot = self.registry.snapshot();
        AuthorityStats {
            connections: self.registry.len(),
            identities: self.registry.identity_count(),
            max_connections: self.registry.max_connections(),
            per_user_limit: self.registry.per_identity(),
            total_admitted: self.totals.admitted.load(Ordering::Relaxed),
            total_rejected: self.totals.rejected.load(Ordering::Relaxed),
            total_evicted: self.totals.evicted.load(Ordering::Relaxed),
            total_swept: self.totals.swept.load(Ordering::Relaxed),
            messages_received: snapshot.iter().map(|c| c.messages_received()).sum(),
            messages_sent: snapshot.iter().map(|c| c.messages_sent()).sum(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Metadata for one live connection.
    pub fn connection_info(&self, id: &str) -> Option<ConnectionInfo> {
        let conn = self.registry.get(id)?;
        let now = Instant::now();
        Some(ConnectionInfo {
            connection_id: conn.id.to_string(),
            user_id: conn.user_id.clone(),
            created_at: conn.created_at,
            connected_secs: now.saturating_duration_since(conn.connected_at).as_secs(),
            idle_secs: conn.idle_for(now).as_secs(),
            since_heartbeat_secs: conn.since_heartbeat(now).as_secs(),
            subscriptions: conn.subscriptions(),
            messages_received: conn.messages_received(),
            messages_sent: conn.messages_sent(),
            errors: conn.error_count(),
            dropped: conn.dropped_count(),
        })
    }
}

fn partition_categories(tags: Vec<String>) -> (Vec<EventCategory>, Vec<String>) {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for tag in tags {
        match tag.parse::<EventCategory>() {
            Ok(c) if !known.contains(&c) => known.push(c),
            Ok(_) => {}
            Err(_) => unknown.push(tag),
        }
    }
    (known, unknown)
}
