//! Rolling heartbeat round-trip samples.

use std::collections::VecDeque;
use std::time::Duration;

/// The most recent `capacity` round-trip times.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyTracker {
    /// Tracker keeping `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, dropping the oldest when full.
    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() >= self.capacity {
            let _ = self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    /// Mean of the retained samples.
    pub fn average(&self) -> Option<Duration> {
        let n = u32::try_from(self.samples.len()).ok().filter(|n| *n > 0)?;
        Some(self.samples.iter().sum::<Duration>() / n)
    }

    /// Retained sample count.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_average() {
        let t = LatencyTracker::new(3);
        assert!(t.average().is_none());
        assert!(t.last().is_none());
    }

    #[test]
    fn rolling_window_of_samples() {
        let mut t = LatencyTracker::new(3);
        for ms in [10, 20, 30, 40] {
            t.record(Duration::from_millis(ms));
        }
        assert_eq!(t.len(), 3);
        assert_eq!(t.last(), Some(Duration::from_millis(40)));
        assert_eq!(t.average(), Some(Duration::from_millis(30)));
    }
}
