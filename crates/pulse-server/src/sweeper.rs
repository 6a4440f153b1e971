//! Stale-connection sweeper.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::authority::{ConnectionAuthority, DisconnectReason};
use crate::metrics::WS_SWEEPS_TOTAL;

/// Periodically closes connections that stopped sending liveness signals.
///
/// A connection is stale once the time since its last `ping` or
/// `heartbeat` exceeds the timeout. Exactly-at-timeout is still live.
pub struct StaleSweeper {
    authority: Arc<ConnectionAuthority>,
    timeout: Duration,
    interval: Duration,
}

impl StaleSweeper {
    /// Sweeper using the authority's configured timeout and period.
    pub fn new(authority: Arc<ConnectionAuthority>) -> Self {
        let timeout = authority.config().heartbeat_timeout;
        let interval = authority.config().sweep_interval;
        Self {
            authority,
            timeout,
            interval,
        }
    }

    /// One pass at `now`. Returns how many connections were closed.
    pub fn sweep_once(&self, now: Instant) -> usize {
        let stale: Vec<_> = self
            .authority
            .registry()
            .snapshot()
            .into_iter()
            .filter(|conn| conn.since_heartbeat(now) > self.timeout)
            .collect();

        let mut swept = 0;
        for conn in stale {
            debug!(
                conn_id = %conn.id,
                silent_secs = conn.since_heartbeat(now).as_secs(),
                "connection missed heartbeat deadline"
            );
            if self
                .authority
                .disconnect(&conn.id, DisconnectReason::HeartbeatTimeout)
            {
                swept += 1;
            }
        }
        counter!(WS_SWEEPS_TOTAL).increment(1);
        if swept > 0 {
            info!(swept, "swept stale connections");
        }
        swept
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep_once(Instant::now());
                }
                () = cancel.cancelled() => {
                    debug!("sweeper stopped");
                    return;
                }
            }
        }
    }
}
