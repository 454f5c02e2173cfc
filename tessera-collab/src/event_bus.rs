//! Topic-based publish/subscribe for cross-cutting notifications.
//!
//! Delivery is synchronous and in registration order. Each callback runs in
//! isolation: a panicking listener is logged and skipped, the rest still run.
//! Listeners registered while an emission is in flight miss that emission.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct BusInner<P> {
    listeners: Mutex<HashMap<String, Vec<(u64, Callback<P>)>>>,
    next_id: AtomicU64,
}

/// Publish/subscribe registry keyed by topic name.
///
/// Cloning is cheap; clones share the same registry.
pub struct EventBus<P> {
    inner: Arc<BusInner<P>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: 'static> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: 'static> EventBus<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for `topic`.
    pub fn on<F>(&self, topic: impl Into<String>, callback: F) -> BusSubscription<P>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        BusSubscription {
            topic,
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `payload` to every listener of `topic`.
    ///
    /// Returns how many listeners completed without panicking.
    pub fn emit(&self, topic: &str, payload: &P) -> usize {
        // Snapshot so listeners may (un)register from inside a callback.
        let callbacks: Vec<Callback<P>> = match self.inner.listeners.lock().get(topic) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return 0,
        };

        callbacks
            .iter()
            .filter(|cb| invoke_isolated(topic, || cb(payload)))
            .count()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .get(topic)
            .map_or(0, |list| list.len())
    }

    /// Drop every listener on every topic.
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }
}

/// Handle returned by [`EventBus::on`].
pub struct BusSubscription<P> {
    topic: String,
    id: u64,
    bus: Weak<BusInner<P>>,
}

impl<P> BusSubscription<P> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the callback. No-op if the bus is gone or was cleared.
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut listeners = bus.listeners.lock();
        if let Some(list) = listeners.get_mut(&self.topic) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                listeners.remove(&self.topic);
            }
        }
    }
}

/// Run a host callback, containing any panic. Returns `false` if it panicked.
pub(crate) fn invoke_isolated<F: FnOnce()>(label: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("Listener for '{label}' panicked: {message}");
            false
        }
    }
}
