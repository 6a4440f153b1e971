//! Per-identity inbound rate limiting.
//!
//! One [`SlidingWindow`] per identity, created on first use. Windows live in
//! a sharded map, so the same identity is serialized by its shard entry and
//! different identities never block each other.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use pulse_core::SlidingWindow;

/// Sliding-window limiter keyed by identity.
pub struct RateLimiter {
    windows: DashMap<String, SlidingWindow>,
    max: usize,
    window: Duration,
}

impl RateLimiter {
    /// Limiter admitting `max` messages per `window` for each identity.
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max,
            window,
        }
    }

    /// Record one message for `identity` if its window has room.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, now())
    }

    /// [`Self::allow`] at an explicit instant.
    pub fn allow_at(&self, identity: &str, at: Instant) -> bool {
        if let Some(mut w) = self.windows.get_mut(identity) {
            return w.try_acquire_at(at);
        }
        self.windows
            .entry(identity.to_owned())
            .or_insert_with(|| SlidingWindow::new(self.max, self.window))
            .try_acquire_at(at)
    }

    /// Time until `identity` regains a slot (zero when not throttled).
    pub fn retry_after(&self, identity: &str) -> Duration {
        let at = now();
        self.windows
            .get_mut(identity)
            .map_or(Duration::ZERO, |mut w| w.retry_after(at))
    }
}

// Goes through tokio's clock so paused-time tests control the window.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hundred_then_refuse() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60));
        let t0 = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow_at("u1", t0));
        }
        assert!(!limiter.allow_at("u1", t0 + Duration::from_secs(1)));
        assert!(limiter.allow_at("u1", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("u1"));
        assert!(!limiter.allow("u1"));
        assert!(limiter.allow("u2"));
        assert!(limiter.retry_after("u1") > Duration::ZERO);
        assert_eq!(limiter.retry_after("u2"), Duration::ZERO);
    }

    #[test]
    fn retry_after_only_when_throttled() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.retry_after("u1"), Duration::ZERO);
        assert!(limiter.allow("u1"));
        assert_eq!(limiter.retry_after("u1"), Duration::ZERO);
        assert!(limiter.allow("u1"));
        assert!(limiter.retry_after("u1") > Duration::from_secs(59));
    }

    #[test]
    fn concurrent_callers_share_one_window() {
        let limiter = Arc::new(RateLimiter::new(50, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.allow("shared")).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
