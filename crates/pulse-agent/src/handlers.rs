//! Per-type inbound message handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use pulse_core::{Envelope, MessageType};

/// Callback invoked for each inbound message of a registered type.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Token returned by [`HandlerRegistry::on`], used to remove the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handlers keyed by message type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageType, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    pub fn on(&self, kind: MessageType, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Call every handler registered for the envelope's type. Returns how
    /// many ran.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let matching: Vec<Handler> = self
            .handlers
            .read()
            .get(&envelope.kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &matching {
            handler(envelope);
        }
        matching.len()
    }
}
