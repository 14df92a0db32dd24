//! Inbound message fan-out.
//!
//! Handlers register under a `type` string or the reserved `"*"` wildcard,
//! which matches in addition to the kind-specific handlers. Dispatch
//! snapshots the handler sets first, so subscribing or unsubscribing from
//! inside a handler never affects the pass that is already running.
//!
//! Heartbeat frames are consumed for liveness upstream and are never
//! dispatched here, wildcard subscribers included.

use deck_core::{Envelope, MessageKind, WILDCARD_KIND};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::warn;

pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Vec<(u64, MessageHandler)>>,
    next_id: u64,
}

impl Registry {
    fn insert(&mut self, kind: &str, handler: MessageHandler) -> u64 {
        let entries = self.handlers.entry(kind.to_string()).or_default();
        // Same handler under the same kind is a set-level no-op: it will
        // never be invoked twice for one message.
        if let Some((id, _)) = entries
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, &handler))
        {
            return *id;
        }
        self.next_id += 1;
        entries.push((self.next_id, handler));
        self.next_id
    }

    fn remove(&mut self, kind: &str, id: u64) {
        if let Some(entries) = self.handlers.get_mut(kind) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                self.handlers.remove(kind);
            }
        }
    }
}

/// Type → handler-set registry, shared by everything that consumes the
/// stream. Cloning is cheap and refers to the same registry.
#[derive(Clone, Default)]
pub struct MessageRouter {
    registry: Arc<Mutex<Registry>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for messages of `kind` (or [`WILDCARD_KIND`]).
    /// The returned [`Subscription`] removes exactly this registration.
    pub fn subscribe(&self, kind: &str, handler: MessageHandler) -> Subscription {
        let id = self.lock().insert(kind, handler);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind: kind.to_string(),
            id,
        }
    }

    /// Convenience wrapper for closures that are not already `Arc`ed.
    pub fn subscribe_fn<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(handler))
    }

    /// Number of handlers currently registered for `kind`.
    pub fn handler_count(&self, kind: &str) -> usize {
        self.lock()
            .handlers
            .get(kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Fans `message` out to the kind-specific handlers, then the wildcard
    /// handlers. A panicking handler is logged and skipped; the rest of
    /// the pass still runs.
    pub fn dispatch(&self, message: &Envelope) {
        if message.kind() == Some(MessageKind::Heartbeat) {
            return;
        }
        let snapshot: Vec<MessageHandler> = {
            let registry = self.lock();
            let mut out = Vec::new();
            if let Some(entries) = registry.handlers.get(&message.r#type) {
                out.extend(entries.iter().map(|(_, handler)| handler.clone()));
            }
            if message.r#type != WILDCARD_KIND {
                if let Some(entries) = registry.handlers.get(WILDCARD_KIND) {
                    out.extend(entries.iter().map(|(_, handler)| handler.clone()));
                }
            }
            out
        };
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                warn!(kind = %message.r#type, "message handler panicked during dispatch");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for one registration. Dropping it without calling
/// [`Subscription::unsubscribe`] leaves the handler registered for the
/// life of the router.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.kind, self.id);
        }
    }
}
