//! Server shutdown: stop accepting, close every connection with 1001, then
//! give live sessions a bounded window to flush their close frames.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TrackedFuture;
use tracing::{info, warn};

use crate::authority::{ConnectionAuthority, DisconnectReason};

/// Stop signal for the accept loop, the sweeper, and every session, plus a
/// tracker of the sessions still writing.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not fired.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// A clone of the stop token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the stop signal.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether the stop signal has fired.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wrap a session so [`Self::drain`] waits for it.
    pub fn track_session<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    /// Sessions that have not finished.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Fire the stop signal, close every connection the authority still
    /// holds, then wait up to `grace` for sessions and `background` tasks.
    ///
    /// Returns how many connections were closed here rather than by their
    /// own session.
    pub async fn drain(
        &self,
        authority: &ConnectionAuthority,
        background: Vec<JoinHandle<()>>,
        grace: Duration,
    ) -> usize {
        self.shutdown();
        let closed = authority.close_all(DisconnectReason::Shutdown);
        let _ = self.sessions.close();
        info!(
            closed,
            sessions = self.sessions.len(),
            tasks = background.len(),
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "draining"
        );

        let wait = async {
            let _ = futures::future::join_all(background).await;
            self.sessions.wait().await;
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(
                sessions = self.sessions.len(),
                "drain timed out; abandoning remaining sessions"
            );
        }
        closed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canceller::NoUploadPipeline;
    use crate::config::ServerConfig;
    use chrono::Duration as ChronoDuration;
    use pulse_auth::{AllowAllDirectory, Claims, JwtCredentialValidator, encode_token};
    use pulse_core::close;
    use std::sync::Arc;

    const SECRET: &str = "shutdown-test";

    fn authority() -> ConnectionAuthority {
        let validator = JwtCredentialValidator::new(SECRET, Arc::new(AllowAllDirectory));
        ConnectionAuthority::new(
            ServerConfig::default(),
            Arc::new(validator),
            Arc::new(NoUploadPipeline),
        )
    }

    fn token(user: &str) -> String {
        encode_token(&Claims::for_user(user, ChronoDuration::minutes(5)), SECRET).unwrap()
    }

    #[test]
    fn every_token_observes_shutdown() {
        let coord = ShutdownCoordinator::default();
        assert!(!coord.is_shutting_down());
        let tokens = [coord.token(), coord.token()];
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[tokio::test]
    async fn drain_closes_connections_with_going_away() {
        let auth = authority();
        let (a, _rx_a) = auth.admit(&token("u1")).await.unwrap();
        let (b, _rx_b) = auth.admit(&token("u2")).await.unwrap();
        let coord = ShutdownCoordinator::new();

        let closed = coord.drain(&auth, Vec::new(), Duration::from_secs(1)).await;
        assert_eq!(closed, 2);
        assert!(coord.is_shutting_down());
        assert!(auth.registry().is_empty());
        assert_eq!(a.close_frame().0, close::GOING_AWAY);
        assert_eq!(b.close_frame().0, close::GOING_AWAY);
    }

    #[tokio::test]
    async fn drain_waits_for_tracked_sessions() {
        let auth = authority();
        let coord = Arc::new(ShutdownCoordinator::new());
        let stop = coord.token();
        let session = tokio::spawn(coord.track_session(async move {
            stop.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }));
        assert_eq!(coord.live_sessions(), 1);

        let _ = coord.drain(&auth, Vec::new(), Duration::from_secs(5)).await;
        assert_eq!(coord.live_sessions(), 0);
        session.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_grace() {
        let auth = authority();
        let coord = ShutdownCoordinator::new();
        let stuck = tokio::spawn(coord.track_session(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        }));
        let background = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        let _ = coord
            .drain(&auth, vec![background], Duration::from_millis(100))
            .await;
        assert_eq!(coord.live_sessions(), 1);
        stuck.abort();
    }
}
