//! State of one admitted connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use pulse_core::{ConnectionId, EventCategory};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::SendError;

/// An admitted client connection.
///
/// Owned by the registry; the session task and broadcasters hold `Arc`s.
/// Monotonic timestamps use `tokio::time::Instant` so timer logic can be
/// tested with a paused clock.
pub struct Connection {
    /// Authority-assigned id.
    pub id: ConnectionId,
    /// Owning identity.
    pub user_id: String,
    /// Wall-clock admission time.
    pub created_at: DateTime<Utc>,
    /// Monotonic admission time.
    pub connected_at: Instant,
    last_activity: Mutex<Instant>,
    last_heartbeat: Mutex<Instant>,
    subscriptions: RwLock<HashSet<EventCategory>>,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    tx: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
    close_frame: Mutex<Option<(u16, String)>>,
}

impl Connection {
    /// Create a connection whose outbound text goes to `tx`.
    pub fn new(user_id: impl Into<String>, tx: mpsc::Sender<Arc<str>>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            connected_at: now,
            last_activity: Mutex::new(now),
            last_heartbeat: Mutex::new(now),
            subscriptions: RwLock::new(HashSet::new()),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            tx,
            cancel: CancellationToken::new(),
            close_frame: Mutex::new(None),
        }
    }

    /// Queue text for the writer task without waiting.
    pub fn send(&self, text: Arc<str>) -> Result<(), SendError> {
        match self.tx.try_send(text) {
            Ok(()) => {
                let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(match err {
                    mpsc::error::TrySendError::Full(_) => SendError::Full,
                    mpsc::error::TrySendError::Closed(_) => SendError::Closed,
                })
            }
        }
    }

    /// Ask the writer to send a close frame and stop. The first call wins.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut frame = self.close_frame.lock();
            if frame.is_none() {
                *frame = Some((code, reason.into()));
            }
        }
        self.cancel.cancel();
    }

    /// Close frame recorded by [`Self::close`] (normal closure if none).
    pub fn close_frame(&self) -> (u16, String) {
        self.close_frame
            .lock()
            .clone()
            .unwrap_or((pulse_core::close::NORMAL, String::new()))
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Record a liveness signal (`ping` or `heartbeat`).
    pub fn touch_heartbeat(&self) {
        let now = Instant::now();
        *self.last_heartbeat.lock() = now;
        *self.last_activity.lock() = now;
    }

    /// Time since the last liveness signal, measured at `now`.
    pub fn since_heartbeat(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_heartbeat.lock())
    }

    /// Time since any inbound activity, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    /// Count one accepted inbound message.
    pub fn record_received(&self) {
        let _ = self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one error reported to this connection.
    pub fn record_error(&self) {
        let _ = self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Add categories; returns the full set afterwards.
    pub fn subscribe(&self, categories: &[EventCategory]) -> Vec<EventCategory> {
        let mut subs = self.subscriptions.write();
        subs.extend(categories.iter().copied());
        sorted(&subs)
    }

    /// Remove categories; returns the full set afterwards.
    pub fn unsubscribe(&self, categories: &[EventCategory]) -> Vec<EventCategory> {
        let mut subs = self.subscriptions.write();
        for c in categories {
            let _ = subs.remove(c);
        }
        sorted(&subs)
    }

    /// Whether this connection receives `category` events.
    pub fn is_subscribed(&self, category: EventCategory) -> bool {
        self.subscriptions.read().contains(&category)
    }

    /// Current subscriptions in catalog order.
    pub fn subscriptions(&self) -> Vec<EventCategory> {
        sorted(&self.subscriptions.read())
    }

    /// Accepted inbound messages.
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Outbound messages queued.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Errors reported to this connection.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Outbound messages that could not be queued.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn sorted(set: &HashSet<EventCategory>) -> Vec<EventCategory> {
    let mut v: Vec<_> = set.iter().copied().collect();
    v.sort_unstable();
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (Connection, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Connection::new("u1", tx), rx)
    }

    #[tokio::test]
    async fn send_queues_text() {
        let (conn, mut rx) = make_connection(4);
        conn.send(Arc::from("hello")).unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
        assert_eq!(conn.messages_sent(), 1);
    }

    #[test]
    fn send_to_full_channel_fails_fast() {
        let (conn, _rx) = make_connection(1);
        conn.send(Arc::from("a")).unwrap();
        assert_eq!(conn.send(Arc::from("b")), Err(SendError::Full));
        assert_eq!(conn.dropped_count(), 1);
    }

    #[test]
    fn send_to_closed_channel_fails() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert_eq!(conn.send(Arc::from("a")), Err(SendError::Closed));
    }

    #[test]
    fn first_close_wins() {
        let (conn, _rx) = make_connection(4);
        assert!(!conn.is_closed());
        conn.close(1008, "superseded by newer connection");
        conn.close(1000, "late");
        assert!(conn.is_closed());
        assert_eq!(conn.close_frame().0, 1008);
    }

    #[test]
    fn default_close_frame_is_normal() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.close_frame(), (1000, String::new()));
    }

    #[test]
    fn subscription_set_semantics() {
        let (conn, _rx) = make_connection(4);
        let all = conn.subscribe(&[EventCategory::FileReady, EventCategory::UploadProgress]);
        assert_eq!(
            all,
            vec![EventCategory::UploadProgress, EventCategory::FileReady]
        );
        let _ = conn.subscribe(&[EventCategory::FileReady]);
        assert_eq!(conn.subscriptions().len(), 2);
        let left = conn.unsubscribe(&[EventCategory::FileReady, EventCategory::ReviewCreated]);
        assert_eq!(left, vec![EventCategory::UploadProgress]);
        assert!(!conn.is_subscribed(EventCategory::FileReady));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_age_tracks_paused_clock() {
        let (conn, _rx) = make_connection(4);
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(conn.since_heartbeat(Instant::now()), Duration::from_secs(45));
        conn.touch_heartbeat();
        assert_eq!(conn.since_heartbeat(Instant::now()), Duration::ZERO);
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn closed_future_resolves_after_close() {
        let (conn, _rx) = make_connection(4);
        let conn = Arc::new(conn);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close(1000, "");
        waiter.await.unwrap();
    }
}
