//! The connection agent state machine.
//!
//! All mutable state sits behind one `parking_lot::Mutex` and every state
//! change goes through [`Shared::transition`]. Background work (handshake,
//! reader, writer, heartbeat, pong watchdogs, flush retry, rate-limit revert,
//! reconnect timer) runs in separate tasks that hold a cancellation token and
//! the epoch they were started in. Leaving an open or connecting state bumps
//! the epoch and cancels the link token, so stale tasks either stop or find
//! the epoch changed and do nothing.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pulse_auth::CredentialSource;
use pulse_core::envelope::{
    ConnectionEstablished, ErrorPayload, PingPayload, PongPayload, SubscriptionAck,
    SubscriptionRequest,
};
use pulse_core::validation::{check_size, parse_raw, validate_client_message, validate_outbound};
use pulse_core::{
    Envelope, ErrorCode, EventCategory, MessageId, MessageType, ProtocolError, ServerLimits,
    SlidingWindow, close,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::errors::{AgentError, Result};
use crate::handlers::{Handler, HandlerId, HandlerRegistry};
use crate::latency::LatencyTracker;
use crate::queue::OutboundQueue;
use crate::state::{AgentNotice, ConnectionState, DropReason, SendOutcome};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NOTICE_CAPACITY: usize = 64;
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Point-in-time view of an agent.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentStats {
    /// Current state.
    pub state: ConnectionState,
    /// Id assigned by the authority for the open connection.
    pub connection_id: Option<String>,
    /// Identity the authority authenticated.
    pub user_id: Option<String>,
    /// Messages written to the socket.
    pub messages_sent: u64,
    /// Messages received from the authority.
    pub messages_received: u64,
    /// Messages discarded locally.
    pub messages_dropped: u64,
    /// Messages waiting in the outbound queue.
    pub queued: usize,
    /// Reconnects scheduled since the last successful handshake.
    pub reconnect_attempts: u32,
    /// Mean heartbeat round trip.
    pub average_latency: Option<Duration>,
    /// Latest heartbeat round trip.
    pub last_latency: Option<Duration>,
    /// Time since the handshake completed.
    pub connected_for: Option<Duration>,
    /// Categories the agent keeps subscribed across reconnects.
    pub subscriptions: Vec<EventCategory>,
}

/// Client end of a Pulse connection.
///
/// Maintains one logical connection: reconnects with capped exponential
/// backoff, heartbeats, queues outbound messages while offline, and keeps
/// itself under the authority's published rate limit.
pub struct ConnectionAgent {
    shared: Arc<Shared>,
}

struct Shared {
    config: AgentConfig,
    credentials: Arc<dyn CredentialSource>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    notice_tx: broadcast::Sender<AgentNotice>,
    handlers: HandlerRegistry,
}

struct Inner {
    state: ConnectionState,
    epoch: u64,
    attempts: u32,
    user_closed: bool,
    queue: OutboundQueue,
    window: SlidingWindow,
    limits: ServerLimits,
    subscriptions: BTreeSet<EventCategory>,
    pending_pongs: HashMap<String, Instant>,
    latency: LatencyTracker,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    connected_at: Option<Instant>,
    connection_id: Option<String>,
    user_id: Option<String>,
    sent: u64,
    received: u64,
    dropped: u64,
    link: CancellationToken,
    reconnect: CancellationToken,
    throttle: CancellationToken,
    flush_retry: CancellationToken,
}

impl ConnectionAgent {
    /// Create an idle agent. Nothing happens until [`Self::connect`].
    pub fn new(config: AgentConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        let limits = config.initial_limits;
        let inner = Inner {
            state: ConnectionState::Disconnected,
            epoch: 0,
            attempts: 0,
            user_closed: false,
            queue: OutboundQueue::new(config.queue_capacity),
            window: SlidingWindow::new(window_size(&limits), limits.rate_window()),
            limits,
            subscriptions: BTreeSet::new(),
            pending_pongs: HashMap::new(),
            latency: LatencyTracker::new(config.latency_samples),
            outbound: None,
            connected_at: None,
            connection_id: None,
            user_id: None,
            sent: 0,
            received: 0,
            dropped: 0,
            link: CancellationToken::new(),
            reconnect: CancellationToken::new(),
            throttle: CancellationToken::new(),
            flush_retry: CancellationToken::new(),
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                credentials,
                inner: Mutex::new(inner),
                state_tx,
                notice_tx,
                handlers: HandlerRegistry::new(),
            }),
        }
    }

    /// Open the connection and wait for `connection.established`.
    ///
    /// Returns immediately when already connected. When the attempt fails
    /// with a retryable error the agent keeps reconnecting in the background
    /// and the error is still returned here.
    pub async fn connect(&self) -> Result<()> {
        let rx = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_open() {
                return Ok(());
            }
            if inner.state == ConnectionState::AuthenticationFailed {
                return Err(AgentError::AuthenticationFailed(
                    "credentials must be refreshed".into(),
                ));
            }
            inner.user_closed = false;
            inner.attempts = 0;
            self.shared.begin_attempt(&mut inner, false)
        };
        rx.await.unwrap_or(Err(AgentError::Cancelled))
    }

    /// Fetch a fresh credential and reconnect. The only way out of
    /// `authentication_failed`.
    pub async fn refresh_credentials(&self) -> Result<()> {
        let rx = {
            let mut inner = self.shared.inner.lock();
            inner.user_closed = false;
            inner.attempts = 0;
            self.shared.begin_attempt(&mut inner, true)
        };
        rx.await.unwrap_or(Err(AgentError::Cancelled))
    }

    /// Close the connection and cancel every timer. No reconnect follows.
    pub fn disconnect(&self) {
        let mut inner = self.shared.inner.lock();
        inner.user_closed = true;
        if let Some(tx) = &inner.outbound {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            })));
        }
        self.shared
            .transition(&mut inner, ConnectionState::Disconnected);
        info!("disconnected by client");
    }

    /// Send a client message.
    ///
    /// Fails fast when the message is not a client type, has the wrong
    /// shape, or exceeds the authority's size limit. Otherwise it is sent,
    /// queued, or dropped as reported by the outcome.
    pub fn send(&self, kind: MessageType, data: Value) -> Result<SendOutcome> {
        if !kind.is_client_message() {
            return Err(ProtocolError::NotClientType(kind.as_str().into()).into());
        }
        let envelope = Envelope::new(kind, data);
        let mut inner = self.shared.inner.lock();
        let text = validate_outbound(&envelope, inner.limits.max_message_size)?;
        Ok(self.shared.send_or_enqueue(&mut inner, text))
    }

    /// Add categories to the subscription set. Sent now when connected and
    /// reissued after every reconnect.
    pub fn subscribe(&self, categories: &[EventCategory]) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        inner.subscriptions.extend(categories.iter().copied());
        self.shared
            .send_subscription(&mut inner, MessageType::Subscribe, categories)
    }

    /// Remove categories from the subscription set.
    pub fn unsubscribe(&self, categories: &[EventCategory]) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        for c in categories {
            let _ = inner.subscriptions.remove(c);
        }
        self.shared
            .send_subscription(&mut inner, MessageType::Unsubscribe, categories)
    }

    /// Register a handler for inbound messages of `kind`.
    pub fn on(&self, kind: impl Into<MessageType>, handler: Handler) -> HandlerId {
        self.shared.handlers.on(kind.into(), handler)
    }

    /// Remove a handler registered with [`Self::on`].
    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.handlers.off(id)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Receive out-of-band notices.
    pub fn notices(&self) -> broadcast::Receiver<AgentNotice> {
        self.shared.notice_tx.subscribe()
    }

    /// Limits currently applied to outbound traffic.
    pub fn limits(&self) -> ServerLimits {
        self.shared.inner.lock().limits
    }

    /// Snapshot of counters and latency.
    pub fn stats(&self) -> AgentStats {
        let inner = self.shared.inner.lock();
        AgentStats {
            state: inner.state,
            connection_id: inner.connection_id.clone(),
            user_id: inner.user_id.clone(),
            messages_sent: inner.sent,
            messages_received: inner.received,
            messages_dropped: inner.dropped,
            queued: inner.queue.len(),
            reconnect_attempts: inner.attempts,
            average_latency: inner.latency.average(),
            last_latency: inner.latency.last(),
            connected_for: inner.connected_at.map(|at| at.elapsed()),
            subscriptions: inner.subscriptions.iter().copied().collect(),
        }
    }
}

impl Drop for ConnectionAgent {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.user_closed = true;
        inner.link.cancel();
        inner.reconnect.cancel();
    }
}

impl std::fmt::Debug for ConnectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAgent")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        let prev = inner.state;
        match next {
            ConnectionState::Connecting => {
                inner.reconnect.cancel();
                inner.link.cancel();
                inner.link = CancellationToken::new();
                Self::reset_link(inner);
            }
            ConnectionState::Connected => inner.throttle.cancel(),
            ConnectionState::RateLimited => {}
            ConnectionState::Reconnecting
            | ConnectionState::Disconnected
            | ConnectionState::Error
            | ConnectionState::AuthenticationFailed => {
                inner.reconnect.cancel();
                inner.link.cancel();
                Self::reset_link(inner);
            }
        }
        inner.state = next;
        if prev != next {
            debug!(from = %prev, to = %next, "state transition");
        }
        let _ = self.state_tx.send_replace(next);
    }

    fn reset_link(inner: &mut Inner) {
        inner.epoch += 1;
        inner.pending_pongs.clear();
        inner.outbound = None;
        inner.connected_at = None;
        inner.connection_id = None;
    }

    fn notify(&self, notice: AgentNotice) {
        let _ = self.notice_tx.send(notice);
    }

    // ── Connecting ──────────────────────────────────────────────────────

    fn begin_attempt(
        self: &Arc<Self>,
        inner: &mut Inner,
        refresh: bool,
    ) -> oneshot::Receiver<Result<()>> {
        self.transition(inner, ConnectionState::Connecting);
        let epoch = inner.epoch;
        let link = inner.link.clone();
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(self);
        drop(tokio::spawn(async move {
            let result = tokio::select! {
                () = link.cancelled() => Err(AgentError::Cancelled),
                r = shared.handshake(refresh) => r,
            };
            let outcome = match result {
                Ok((ws, established)) => shared.on_open(epoch, ws, established),
                Err(err) => {
                    shared.on_attempt_failed(epoch, &err);
                    Err(err)
                }
            };
            let _ = tx.send(outcome);
        }));
        rx
    }

    async fn handshake(&self, refresh: bool) -> Result<(WsStream, ConnectionEstablished)> {
        let attempt = async {
            let token = if refresh {
                self.credentials.refresh().await?
            } else {
                self.credentials.token().await?
            };
            let url = self.config.endpoint(&token);
            let (mut ws, _) = connect_async(url.as_str()).await?;
            let established = await_established(&mut ws).await?;
            Ok((ws, established))
        };
        tokio::time::timeout(self.config.connect_timeout, attempt)
            .await
            .unwrap_or(Err(AgentError::HandshakeTimeout))
    }

    fn on_open(
        self: &Arc<Self>,
        epoch: u64,
        ws: WsStream,
        established: ConnectionEstablished,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            return Err(AgentError::Cancelled);
        }
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();

        inner.attempts = 0;
        inner.connected_at = Some(Instant::now());
        inner.outbound = Some(tx);
        Self::adopt_limits(&mut inner, established.limits);
        self.transition(&mut inner, ConnectionState::Connected);
        inner.connection_id = Some(established.connection_id.clone());
        inner.user_id = Some(established.user_id.clone());

        let link = inner.link.clone();
        let interval = self.heartbeat_interval(&inner);
        drop(tokio::spawn(write_loop(sink, rx, link.clone())));
        drop(tokio::spawn(Arc::clone(self).read_loop(stream, epoch, link.clone())));
        drop(tokio::spawn(Arc::clone(self).heartbeat_loop(epoch, link, interval)));

        if !inner.subscriptions.is_empty() {
            let categories: Vec<EventCategory> = inner.subscriptions.iter().copied().collect();
            self.send_subscription(&mut inner, MessageType::Subscribe, &categories)?;
        }
        self.flush(&mut inner);

        info!(
            conn_id = %established.connection_id,
            user_id = %established.user_id,
            queued = inner.queue.len(),
            "connected"
        );
        Ok(())
    }

    fn adopt_limits(inner: &mut Inner, limits: ServerLimits) {
        inner
            .window
            .reconfigure(window_size(&limits), limits.rate_window());
        inner.limits = limits;
    }

    fn heartbeat_interval(&self, inner: &Inner) -> Duration {
        let server = inner.limits.heartbeat_interval();
        let interval = if server.is_zero() {
            self.config.heartbeat_interval
        } else {
            server.min(self.config.heartbeat_interval)
        };
        interval.max(MIN_HEARTBEAT_INTERVAL)
    }

    fn on_attempt_failed(self: &Arc<Self>, epoch: u64, err: &AgentError) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            return;
        }
        match err {
            AgentError::AuthenticationFailed(reason) => {
                self.authentication_failed(&mut inner, reason);
            }
            AgentError::Credentials(source) => {
                warn!(error = %source, "credential source failed");
                self.transition(&mut inner, ConnectionState::Error);
            }
            AgentError::Cancelled => {}
            other => {
                warn!(error = %other, attempt = inner.attempts, "connection attempt failed");
                self.schedule_reconnect(&mut inner);
            }
        }
    }

    fn authentication_failed(&self, inner: &mut Inner, reason: &str) {
        warn!(reason, "authentication rejected; waiting for refreshed credentials");
        self.transition(inner, ConnectionState::AuthenticationFailed);
        self.notify(AgentNotice::AuthenticationFailed {
            reason: reason.to_owned(),
        });
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if !self.config.auto_reconnect {
            self.transition(inner, ConnectionState::Disconnected);
            return;
        }
        if inner.attempts >= self.config.max_reconnect_attempts {
            warn!(attempts = inner.attempts, "reconnect attempts exhausted");
            self.transition(inner, ConnectionState::Error);
            self.notify(AgentNotice::ReconnectExhausted {
                attempts: inner.attempts,
            });
            return;
        }

        let delay = self.config.backoff.delay(inner.attempts);
        inner.attempts += 1;
        self.transition(inner, ConnectionState::Reconnecting);
        inner.reconnect = CancellationToken::new();
        let token = inner.reconnect.clone();
        let epoch = inner.epoch;
        info!(attempt = inner.attempts, delay_ms = millis(delay), "reconnect scheduled");
        self.notify(AgentNotice::Reconnecting {
            attempt: inner.attempts,
            delay,
        });

        let shared = Arc::clone(self);
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let mut inner = shared.inner.lock();
                    if inner.epoch == epoch && inner.state == ConnectionState::Reconnecting {
                        drop(shared.begin_attempt(&mut inner, false));
                    }
                }
            }
        }));
    }

    // ── Open connection ─────────────────────────────────────────────────

    async fn read_loop(
        self: Arc<Self>,
        mut stream: SplitStream<WsStream>,
        epoch: u64,
        link: CancellationToken,
    ) {
        let (code, reason) = loop {
            tokio::select! {
                () = link.cancelled() => return,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_text(epoch, text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or((1005, String::new()), |f| {
                            (u16::from(f.code), f.reason.as_str().to_owned())
                        });
                    }
                    Some(Ok(Message::Binary(_))) => debug!("ignoring binary frame"),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break (1006, err.to_string()),
                    None => break (1006, "stream ended".to_owned()),
                }
            }
        };
        self.on_closed(epoch, code, &reason);
    }

    fn on_closed(self: &Arc<Self>, epoch: u64, code: u16, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.user_closed || !inner.state.is_open() {
            return;
        }
        if close::is_auth_failure(code) {
            self.authentication_failed(&mut inner, reason);
            return;
        }
        warn!(code, reason, "connection lost");
        self.schedule_reconnect(&mut inner);
    }

    fn on_text(self: &Arc<Self>, epoch: u64, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "ignoring unreadable frame");
                return;
            }
        };
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.received += 1;
            match envelope.kind {
                MessageType::Pong => {
                    if let Some(id) = envelope
                        .payload::<PongPayload>()
                        .ok()
                        .and_then(|p| p.correlation_id)
                    {
                        if let Some(sent) = inner.pending_pongs.remove(&id) {
                            inner.latency.record(sent.elapsed());
                        }
                    }
                }
                MessageType::Error => {
                    if let Ok(err) = envelope.payload::<ErrorPayload>() {
                        self.on_server_error(&mut inner, err);
                    }
                }
                MessageType::SubscriptionAcknowledged => {
                    if let Ok(ack) = envelope.payload::<SubscriptionAck>() {
                        if !ack.rejected.is_empty() {
                            warn!(
                                rejected = ?ack.rejected,
                                "authority rejected subscription categories"
                            );
                            inner
                                .subscriptions
                                .retain(|c| !ack.rejected.iter().any(|r| r == c.as_str()));
                        }
                    }
                }
                _ => {}
            }
        }
        let _ = self.handlers.dispatch(&envelope);
    }

    fn on_server_error(self: &Arc<Self>, inner: &mut Inner, err: ErrorPayload) {
        warn!(code = %err.code.as_str(), message = %err.message, "authority reported an error");
        if err.code == ErrorCode::RateLimited {
            let retry_after = err.retry_after_ms.map_or_else(
                || inner.window.retry_after(now_std()),
                Duration::from_millis,
            );
            self.enter_rate_limited(inner, retry_after);
        }
        self.notify(AgentNotice::ServerError {
            code: err.code,
            message: err.message,
        });
    }

    async fn heartbeat_loop(
        self: Arc<Self>,
        epoch: u64,
        link: CancellationToken,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = link.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(correlation_id) = self.send_ping(epoch) else {
                return;
            };
            let shared = Arc::clone(&self);
            let watchdog = link.clone();
            let timeout = self.config.pong_timeout;
            drop(tokio::spawn(async move {
                tokio::select! {
                    () = watchdog.cancelled() => {}
                    () = tokio::time::sleep(timeout) => shared.check_pong(epoch, &correlation_id),
                }
            }));
        }
    }

    fn send_ping(&self, epoch: u64) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || !inner.state.is_open() {
            return None;
        }
        let correlation_id = MessageId::new().into_inner();
        let ping = PingPayload {
            correlation_id: Some(correlation_id.clone()),
        };
        let envelope = Envelope::from_payload(MessageType::Ping, &ping).ok()?;
        if let Err(err) = self.send_control(&mut inner, &envelope) {
            warn!(error = %err, "could not build heartbeat");
            return None;
        }
        let _ = inner
            .pending_pongs
            .insert(correlation_id.clone(), Instant::now());
        Some(correlation_id)
    }

    fn check_pong(&self, epoch: u64, correlation_id: &str) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch && inner.pending_pongs.remove(correlation_id).is_some() {
            warn!(correlation_id, "pong not received in time");
            self.notify(AgentNotice::PongTimeout {
                correlation_id: correlation_id.to_owned(),
            });
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────

    fn send_or_enqueue(self: &Arc<Self>, inner: &mut Inner, text: String) -> SendOutcome {
        if inner.state == ConnectionState::Connected && inner.queue.is_empty() {
            let now = now_std();
            if !inner.window.try_acquire_at(now) {
                let retry_after = inner.window.retry_after(now);
                inner.dropped += 1;
                warn!(
                    retry_after_ms = millis(retry_after),
                    "outbound rate limit reached; message dropped"
                );
                self.enter_rate_limited(inner, retry_after);
                return SendOutcome::Dropped(DropReason::RateLimited);
            }
            return if Self::write(inner, text) {
                SendOutcome::Sent
            } else {
                inner.dropped += 1;
                SendOutcome::Dropped(DropReason::NotConnected)
            };
        }
        if !self.config.queue_enabled {
            inner.dropped += 1;
            warn!(state = %inner.state, "not connected and queueing disabled; message dropped");
            return SendOutcome::Dropped(DropReason::QueueDisabled);
        }
        if inner.queue.push(text).is_some() {
            inner.dropped += 1;
            warn!(
                capacity = self.config.queue_capacity,
                "outbound queue full; oldest message dropped"
            );
            self.notify(AgentNotice::QueueOverflow);
        }
        SendOutcome::Queued
    }

    /// Control frames skip the queue. They take a window slot when one is
    /// free but are never held back by the window.
    fn send_control(&self, inner: &mut Inner, envelope: &Envelope) -> Result<()> {
        let text = validate_outbound(envelope, inner.limits.max_message_size)?;
        let _ = inner.window.try_acquire_at(now_std());
        let _ = Self::write(inner, text);
        Ok(())
    }

    fn send_subscription(
        &self,
        inner: &mut Inner,
        kind: MessageType,
        categories: &[EventCategory],
    ) -> Result<()> {
        if categories.is_empty() || !inner.state.is_open() {
            return Ok(());
        }
        let request = SubscriptionRequest::for_categories(categories);
        let envelope = Envelope::from_payload(kind, &request)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.send_control(inner, &envelope)
    }

    fn write(inner: &mut Inner, text: String) -> bool {
        let Some(tx) = &inner.outbound else {
            return false;
        };
        if tx.send(Message::Text(text.into())).is_err() {
            return false;
        }
        inner.sent += 1;
        true
    }

    /// Drain the queue oldest-first while connected.
    fn flush(self: &Arc<Self>, inner: &mut Inner) {
        let mut flushed = 0usize;
        while inner.state == ConnectionState::Connected {
            let Some(front) = inner.queue.front() else {
                break;
            };
            if let Err(err) = revalidate(front, inner.limits.max_message_size) {
                let _ = inner.queue.pop();
                inner.dropped += 1;
                warn!(error = %err, "queued message no longer valid; dropped");
                continue;
            }
            let now = now_std();
            if !inner.window.try_acquire_at(now) {
                let retry_after = inner.window.retry_after(now);
                debug!(
                    remaining = inner.queue.len(),
                    retry_after_ms = millis(retry_after),
                    "flush paused by rate window"
                );
                self.schedule_flush(inner, retry_after);
                break;
            }
            let Some(text) = inner.queue.pop() else {
                break;
            };
            if !Self::write(inner, text) {
                inner.dropped += 1;
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, "outbound queue flushed");
        }
    }

    fn schedule_flush(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        inner.flush_retry.cancel();
        inner.flush_retry = inner.link.child_token();
        let token = inner.flush_retry.clone();
        let epoch = inner.epoch;
        let shared = Arc::clone(self);
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let mut inner = shared.inner.lock();
                    if inner.epoch == epoch {
                        shared.flush(&mut inner);
                    }
                }
            }
        }));
    }

    fn enter_rate_limited(self: &Arc<Self>, inner: &mut Inner, retry_after: Duration) {
        if !inner.state.is_open() {
            return;
        }
        self.transition(inner, ConnectionState::RateLimited);
        self.notify(AgentNotice::RateLimited { retry_after });

        inner.throttle.cancel();
        inner.throttle = inner.link.child_token();
        let token = inner.throttle.clone();
        let epoch = inner.epoch;
        let shared = Arc::clone(self);
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(retry_after) => {
                    let mut inner = shared.inner.lock();
                    if inner.epoch == epoch && inner.state == ConnectionState::RateLimited {
                        debug!("rate window cleared");
                        shared.transition(&mut inner, ConnectionState::Connected);
                        shared.flush(&mut inner);
                    }
                }
            }
        }));
    }
}

async fn await_established(ws: &mut WsStream) -> Result<ConnectionEstablished> {
    let mut refusal: Option<String> = None;
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope: Envelope = serde_json::from_str(text.as_str())
                    .map_err(|e| AgentError::Handshake(e.to_string()))?;
                match envelope.kind {
                    MessageType::ConnectionEstablished => {
                        return envelope
                            .payload::<ConnectionEstablished>()
                            .map_err(|e| AgentError::Handshake(e.to_string()));
                    }
                    // The close frame that follows carries the code.
                    MessageType::Error => {
                        refusal = envelope
                            .payload::<ErrorPayload>()
                            .ok()
                            .map(|e| e.message);
                    }
                    other => return Err(AgentError::Handshake(other.as_str().to_owned())),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame.map_or((1005, String::new()), |f| {
                    (u16::from(f.code), f.reason.as_str().to_owned())
                });
                let reason = refusal.unwrap_or(reason);
                if close::is_auth_failure(code) {
                    return Err(AgentError::AuthenticationFailed(reason));
                }
                return Err(AgentError::Closed { code, reason });
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(AgentError::Transport(
                    "connection closed during handshake".into(),
                ));
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    link: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let closing = matches!(msg, Message::Close(_));
                if let Err(err) = sink.send(msg).await {
                    debug!(error = %err, "write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            () = link.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}

fn revalidate(text: &str, max: usize) -> std::result::Result<(), ProtocolError> {
    check_size(text.len(), max)?;
    let _ = validate_client_message(parse_raw(text.as_bytes())?)?;
    Ok(())
}

fn window_size(limits: &ServerLimits) -> usize {
    usize::try_from(limits.rate_limit_messages).unwrap_or(usize::MAX)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// Goes through tokio's clock so paused-time tests control the window.
fn now_std() -> std::time::Instant {
    Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pulse_auth::StaticCredentialSource;
    use serde_json::json;

    fn agent(config: AgentConfig) -> ConnectionAgent {
        ConnectionAgent::new(config, Arc::new(StaticCredentialSource::new("token")))
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let a = agent(AgentConfig::default());
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert_eq!(*a.state_changes().borrow(), ConnectionState::Disconnected);
        assert_eq!(a.stats().queued, 0);
    }

    #[tokio::test]
    async fn offline_sends_are_queued() {
        let a = agent(AgentConfig::default());
        let outcome = a.send(MessageType::Ping, json!({})).unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(a.stats().queued, 1);
    }

    #[tokio::test]
    async fn offline_send_without_queue_is_dropped() {
        let a = agent(AgentConfig {
            queue_enabled: false,
            ..AgentConfig::default()
        });
        let outcome = a.send(MessageType::Heartbeat, json!({})).unwrap();
        assert_eq!(outcome, SendOutcome::Dropped(DropReason::QueueDisabled));
        assert_eq!(a.stats().messages_dropped, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_notifies() {
        let a = agent(AgentConfig {
            queue_capacity: 2,
            ..AgentConfig::default()
        });
        let mut notices = a.notices();
        for _ in 0..3 {
            let _ = a.send(MessageType::Heartbeat, json!({})).unwrap();
        }
        let stats = a.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(notices.try_recv().unwrap(), AgentNotice::QueueOverflow);
    }

    #[tokio::test]
    async fn server_only_types_are_rejected_locally() {
        let a = agent(AgentConfig::default());
        let err = a.send(MessageType::Pong, json!({})).unwrap_err();
        assert_matches!(err, AgentError::InvalidMessage(ProtocolError::NotClientType(_)));
        let err = a
            .send(EventCategory::FileReady.into(), json!({}))
            .unwrap_err();
        assert_matches!(err, AgentError::InvalidMessage(_));
    }

    #[tokio::test]
    async fn bad_shape_and_size_fail_fast() {
        let a = agent(AgentConfig::default());
        let err = a.send(MessageType::UploadCancel, json!({})).unwrap_err();
        assert_matches!(
            err,
            AgentError::InvalidMessage(ProtocolError::InvalidPayload { .. })
        );
        let big = json!({"pad": "x".repeat(70_000)});
        let err = a.send(MessageType::Heartbeat, big).unwrap_err();
        assert_matches!(err, AgentError::InvalidMessage(ProtocolError::TooLarge { .. }));
        assert_eq!(a.stats().queued, 0);
    }

    #[tokio::test]
    async fn subscriptions_are_mirrored_offline() {
        let a = agent(AgentConfig::default());
        a.subscribe(&[EventCategory::FileReady, EventCategory::UploadProgress])
            .unwrap();
        a.unsubscribe(&[EventCategory::FileReady]).unwrap();
        assert_eq!(a.stats().subscriptions, vec![EventCategory::UploadProgress]);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let a = agent(AgentConfig::default());
        a.disconnect();
        a.disconnect();
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn revalidate_rechecks_queued_text() {
        let ok = Envelope::new(MessageType::Ping, json!({})).to_json().unwrap();
        assert!(revalidate(&ok, 65_536).is_ok());
        assert_matches!(revalidate(&ok, 10), Err(ProtocolError::TooLarge { .. }));
        assert_matches!(revalidate("nope", 65_536), Err(ProtocolError::Malformed(_)));
    }
}
