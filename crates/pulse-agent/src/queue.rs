//! Bounded outbound queue that drops its oldest entry when full.

use std::collections::VecDeque;

/// FIFO of serialized messages waiting for a connection.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<String>,
    capacity: usize,
}

impl OutboundQueue {
    /// Empty queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append `text`. Returns the evicted oldest entry when full.
    pub fn push(&mut self, text: String) -> Option<String> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(text);
        evicted
    }

    /// Oldest entry.
    pub fn front(&self) -> Option<&str> {
        self.items.front().map(String::as_str)
    }

    /// Remove and return the oldest entry.
    pub fn pop(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
