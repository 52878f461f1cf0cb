//! Typed event bus with deterministic unsubscribe
//!
//! An explicit mapping from event name to an ordered list of subscriber
//! callbacks. Handlers fire in subscription order; unsubscribe is keyed by
//! the [`HandlerId`] returned at subscription time and is idempotent.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Subscriber callback. Payloads are passed by reference and never mutated.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Opaque subscription token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Event name to ordered subscriber list.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events: Vec<String> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, subs)| format!("{}({})", name, subs.len()))
            .collect();
        f.debug_struct("EventBus").field("events", &events).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns whether anything was
    /// removed; calling again with the same id is a no-op.
    pub fn unsubscribe(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(subs) = handlers.get_mut(event) {
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            let removed = subs.len() != before;
            if subs.is_empty() {
                handlers.remove(event);
            }
            return removed;
        }
        false
    }

    /// Invoke all handlers for an event, in subscription order.
    ///
    /// The subscriber list is snapshotted before dispatch, so handlers may
    /// subscribe or unsubscribe re-entrantly without deadlocking.
    pub fn emit(&self, event: &str, data: &Value) {
        let subs: Vec<EventHandler> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(event) {
                Some(subs) => subs.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        for handler in subs {
            handler(data);
        }
    }

    /// Number of handlers registered for an event.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .unwrap()
            .get(event)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.handlers.lock().unwrap().clear();
    }
}
