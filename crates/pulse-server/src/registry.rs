//! Connection registry: lookup by id and by identity, plus the caps.
//!
//! Two sharded indices and an atomic live counter. Admission for one
//! identity is serialized by that identity's entry lock; different
//! identities never contend. Lock order is identity entry, then connection
//! shard. `remove` takes the connection shard and releases it before it
//! touches the identity index, so the two paths cannot deadlock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use pulse_core::ConnectionId;

use crate::connection::Connection;

/// Result of a successful or refused admission.
#[derive(Debug)]
pub enum Admission {
    /// Registered. `evicted` is the identity's oldest connection when the
    /// per-identity cap was reached; the caller must close it.
    Admitted {
        /// Connection removed to make room.
        evicted: Option<Arc<Connection>>,
    },
    /// Global cap reached; nothing changed.
    AtCapacity,
}

/// Live connections indexed by id and by identity.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    by_identity: DashMap<String, VecDeque<ConnectionId>>,
    live: AtomicUsize,
    max_connections: usize,
    per_identity: usize,
}

impl ConnectionRegistry {
    /// Empty registry with the given caps.
    pub fn new(max_connections: usize, per_identity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_identity: DashMap::new(),
            live: AtomicUsize::new(0),
            max_connections,
            per_identity: per_identity.max(1),
        }
    }

    /// Register `conn`, evicting the identity's oldest connection if the
    /// identity is at its cap.
    ///
    /// An eviction hands its slot to the newcomer, so a full authority still
    /// admits a replacement for an identity at its cap. An identity below
    /// its cap is refused when the global cap is reached.
    pub fn admit(&self, conn: Arc<Connection>) -> Admission {
        let user_id = conn.user_id.clone();
        let mut ids = self.by_identity.entry(user_id.clone()).or_default();

        let mut evicted = None;
        if ids.len() >= self.per_identity {
            while let Some(oldest) = ids.pop_front() {
                if let Some((_, old)) = self.connections.remove(&oldest) {
                    evicted = Some(old);
                    break;
                }
            }
        }

        // An evicted connection's slot transfers to the newcomer; otherwise
        // reserve a fresh one.
        if evicted.is_none() && !self.reserve_slot() {
            let empty = ids.is_empty();
            drop(ids);
            if empty {
                let _ = self.by_identity.remove_if(&user_id, |_, ids| ids.is_empty());
            }
            return Admission::AtCapacity;
        }

        ids.push_back(conn.id.clone());
        let _ = self.connections.insert(conn.id.clone(), conn);
        Admission::Admitted { evicted }
    }

    fn reserve_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .is_ok()
    }

    /// Remove a connection. Only the first caller for a given id gets it
    /// back; later or concurrent callers get `None`.
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        let _ = self.live.fetch_sub(1, Ordering::AcqRel);
        if let Some(mut ids) = self.by_identity.get_mut(&conn.user_id) {
            ids.retain(|c| c.as_str() != id);
        }
        let _ = self
            .by_identity
            .remove_if(&conn.user_id, |_, ids| ids.is_empty());
        Some(conn)
    }

    /// Look up a live connection.
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Point-in-time copy of every live connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    /// Live connections of one identity, oldest first.
    pub fn connections_for(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = self
            .by_identity
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of identities with at least one live connection.
    pub fn identity_count(&self) -> usize {
        self.by_identity.len()
    }

    /// Global cap.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Per-identity cap.
    pub fn per_identity(&self) -> usize {
        self.per_identity
    }
}
