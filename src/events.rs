//! In-process publish/subscribe for sync and network status.
//!
//! Listeners run synchronously on the emitting task, in subscription order.
//! A panicking listener is logged and skipped; delivery to the remaining
//! listeners and the emitter's own state are unaffected.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

/// Broadcaster for one event source.
pub struct EventBus<E> {
    name: &'static str,
    registry: Arc<Registry<E>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.registry.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }

        let weak: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    if let Ok(mut listeners) = registry.listeners.lock() {
                        listeners.retain(|(lid, _)| *lid != id);
                    }
                }
            })),
        }
    }

    /// Deliver `event` to every current listener.
    pub fn emit(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe while being called.
        let snapshot: Vec<Listener<E>> = match self.registry.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(source = self.name, "Event listener panicked; continuing delivery");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut listeners) = self.registry.listeners.lock() {
            listeners.clear();
        }
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the listener
/// registered; call `unsubscribe` to remove it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Lifecycle events emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted {
        count: usize,
    },
    TransactionSynced {
        local_id: String,
        offline_receipt: String,
        server_transaction_id: String,
        server_receipt_number: String,
        attempts: u32,
    },
    TransactionFailed {
        local_id: String,
        offline_receipt: String,
        error: String,
        attempts: u32,
    },
    SyncCompleted {
        synced: usize,
        failed: usize,
    },
    SyncFailed {
        synced: usize,
        failed: usize,
    },
}
