//! Observer registry: per-kind event handlers with disposer tokens.
//!
//! Emission iterates over a snapshot of the handler list, so a handler may
//! unsubscribe itself (or others) while an event is being delivered. Each
//! handler runs with its own error containment: a failing or panicking handler
//! is logged and never prevents the remaining handlers from running.

use courier_types::event::{ChannelEvent, EventKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error};

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber callback.
pub type EventHandler = Arc<dyn Fn(&ChannelEvent) -> Result<(), HandlerError> + Send + Sync>;

struct Entry {
    id: u64,
    handler: EventHandler,
}

/// Handler lists keyed by event kind.
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<Entry>>>,
}

impl EventRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Entry>>> {
        // A handler never runs under the lock, so poisoning can only come from
        // a panic inside this module's own bookkeeping; the map is still valid.
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(self: &Arc<Self>, kind: EventKind, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(kind)
            .or_default()
            .push(Entry { id, handler });
        debug!(%kind, id, "Event handler subscribed");
        Subscription {
            registry: Arc::downgrade(self),
            kind,
            id,
        }
    }

    /// Register a closure for events of `kind`.
    pub fn on<F>(self: &Arc<Self>, kind: EventKind, f: F) -> Subscription
    where
        F: Fn(&ChannelEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(f))
    }

    fn remove(&self, kind: EventKind, id: u64) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.id != id);
        before != list.len()
    }

    /// Number of handlers currently registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// Returns how many handlers completed without error.
    pub fn emit(&self, event: &ChannelEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(u64, EventHandler)> = self
            .lock()
            .get(&kind)
            .map(|list| list.iter().map(|e| (e.id, e.handler.clone())).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => error!(%kind, id, error = %e, "Event handler failed"),
                Err(_) => error!(%kind, id, "Event handler panicked"),
            }
        }
        delivered
    }
}

/// Disposer returned by `subscribe`.
///
/// Holds only a weak reference, so an outstanding token never keeps a
/// channel's registry alive.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<EventRegistry>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.kind, self.id),
            None => false,
        }
    }
}
