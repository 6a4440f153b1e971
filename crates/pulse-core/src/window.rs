//! Sliding-window message counter.
//!
//! Keeps the instants of admitted messages inside the trailing window. A
//! message is admitted when fewer than `max` instants remain after pruning
//! those older than `now - window`. Rejected attempts are not recorded, so a
//! flooding sender regains capacity as its old messages age out.
//!
//! Callers pass `now` explicitly so the counter works with both
//! `std::time::Instant` and a paused `tokio::time` clock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-sender rolling window.
#[derive(Clone, Debug)]
pub struct SlidingWindow {
    max: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Create a window admitting `max` messages per `window`.
    #[must_use]
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: VecDeque::with_capacity(max.min(1024)),
        }
    }

    /// Try to admit one message at `now`. Returns `false` when the window is
    /// full; nothing is recorded in that case.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.hits.len() >= self.max {
            return false;
        }
        self.hits.push_back(now);
        true
    }

    /// Instant at which the next slot frees up, or `None` if a message
    /// would be admitted right now.
    pub fn reset_at(&mut self, now: Instant) -> Option<Instant> {
        self.prune(now);
        if self.hits.len() < self.max {
            return None;
        }
        self.hits.front().map(|oldest| *oldest + self.window)
    }

    /// Time until the next slot frees up (zero when not throttled).
    pub fn retry_after(&mut self, now: Instant) -> Duration {
        self.reset_at(now)
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    /// Adopt new limits, keeping recorded history.
    pub fn reconfigure(&mut self, max: usize, window: Duration) {
        self.max = max;
        self.window = window;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.hits.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                let _ = self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn admits_up_to_max_then_rejects() {
        let start = Instant::now();
        let mut w = SlidingWindow::new(100, WINDOW);
        for i in 0..100 {
            assert!(w.try_acquire_at(start + Duration::from_millis(i)));
        }
        assert!(!w.try_acquire_at(start + Duration::from_millis(100)));
        assert_eq!(
            w.reset_at(start + Duration::from_millis(100)),
            Some(start + WINDOW)
        );
    }

    #[test]
    fn rejected_attempts_are_not_counted() {
        let start = Instant::now();
        let mut w = SlidingWindow::new(2, WINDOW);
        assert!(w.try_acquire_at(start));
        assert!(w.try_acquire_at(start));
        for _ in 0..50 {
            assert!(!w.try_acquire_at(start + Duration::from_secs(1)));
        }
        assert!(w.try_acquire_at(start + WINDOW));
    }

    #[test]
    fn capacity_returns_after_window() {
        let start = Instant::now();
        let mut w = SlidingWindow::new(100, WINDOW);
        for _ in 0..100 {
            assert!(w.try_acquire_at(start));
        }
        assert!(!w.try_acquire_at(start + Duration::from_secs(59)));
        assert!(w.try_acquire_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn reset_at_points_at_oldest_plus_window() {
        let start = Instant::now();
        let mut w = SlidingWindow::new(2, WINDOW);
        assert_eq!(w.reset_at(start), None);
        assert!(w.try_acquire_at(start));
        assert!(w.try_acquire_at(start + Duration::from_secs(10)));
        assert_eq!(
            w.reset_at(start + Duration::from_secs(20)),
            Some(start + WINDOW)
        );
        assert_eq!(
            w.retry_after(start + Duration::from_secs(20)),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn reconfigure_keeps_history() {
        let start = Instant::now();
        let mut w = SlidingWindow::new(5, WINDOW);
        for _ in 0..3 {
            assert!(w.try_acquire_at(start));
        }
        w.reconfigure(3, WINDOW);
        assert!(!w.try_acquire_at(start));
        w.reconfigure(4, WINDOW);
        assert!(w.try_acquire_at(start));
        assert!(!w.try_acquire_at(start));
    }

    proptest! {
        #[test]
        fn never_exceeds_max_in_any_window(
            max in 1usize..20,
            gaps in prop::collection::vec(0u64..5_000, 1..300),
        ) {
            let window = Duration::from_secs(10);
            let start = Instant::now();
            let mut w = SlidingWindow::new(max, window);
            let mut admitted: Vec<Instant> = Vec::new();
            let mut now = start;
            for gap in gaps {
                now += Duration::from_millis(gap);
                if w.try_acquire_at(now) {
                    admitted.push(now);
                }
                let in_window = admitted
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < window)
                    .count();
                prop_assert!(in_window <= max);
            }
        }
    }
}
