//! Event Dispatch
//!
//! A per-instance named-event registry used by the client and by every
//! session. Each component owns its own [`EventHub`]; there is no global
//! registry, so listeners never leak across instances.
//!
//! Dispatch takes an immutable snapshot of the listener list before invoking
//! anything, so a callback may register or unregister listeners (including
//! itself) without corrupting the in-flight dispatch. A panicking listener is
//! reported and skipped; it never aborts dispatch to the remaining listeners.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// A registered event callback.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle identifying one registered listener, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    callback: Callback,
}

#[derive(Default)]
struct HubInner {
    listeners: HashMap<String, Vec<Registered>>,
    next_id: u64,
}

/// Named-event subscribe/publish hub, scoped to one component instance.
#[derive(Default)]
pub struct EventHub {
    inner: Mutex<HubInner>,
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `event`. Listeners fire in registration
    /// order.
    pub fn on(
        &self,
        event: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(Registered {
                id,
                callback: Arc::new(callback),
            });
        id
    }

    /// Remove one listener. Returns `true` if it was registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(list) = inner.listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|registered| registered.id != id);
        before != list.len()
    }

    /// Remove every listener registered under `event`.
    pub fn clear(&self, event: &str) {
        self.inner.lock().listeners.remove(event);
    }

    /// Publish `payload` to every listener of `event`.
    ///
    /// The listener list is snapshotted before the first invocation and no
    /// lock is held while callbacks run.
    pub fn emit(&self, event: &str, payload: &Value) {
        let snapshot: Vec<Callback> = {
            let inner = self.inner.lock();
            inner.listeners.get(event).map_or_else(Vec::new, |list| {
                list.iter().map(|r| r.callback.clone()).collect()
            })
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                tracing::error!(event, "listener panicked during dispatch");
            }
        }
    }

    /// Number of listeners currently registered under `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .listeners
            .get(event)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        let mut map = f.debug_map();
        for (event, list) in &inner.listeners {
            map.entry(event, &list.len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn listeners_fire_in_registration_order() {
        let hub = EventHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            hub.on("update", move |_| order.lock().push(tag));
        }

        hub.emit("update", &Value::Null);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn off_removes_only_the_target_listener() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let keep = hub.on("e", move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let drop_me = hub.on("e", move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        assert!(hub.off("e", drop_me));
        assert!(!hub.off("e", drop_me));
        hub.emit("e", &Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count("e"), 1);
        let _ = keep;
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let hub = Arc::new(EventHub::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let hub2 = hub.clone();
        let fired2 = fired.clone();
        hub.on("e", move |_| {
            let fired3 = fired2.clone();
            hub2.on("e", move |_| {
                fired3.fetch_add(1, Ordering::SeqCst);
            });
        });

        // The newly registered listener is not part of the first snapshot.
        hub.emit("e", &Value::Null);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        hub.emit("e", &Value::Null);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_abort_dispatch() {
        let hub = EventHub::new();
        let reached = Arc::new(AtomicUsize::new(0));

        hub.on("e", |_| panic!("listener failure"));
        let reached2 = reached.clone();
        hub.on("e", move |_| {
            reached2.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit("e", &json!({"k": "v"}));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emit_with_no_listeners_is_a_noop() {
        let hub = EventHub::new();
        hub.emit("nobody", &Value::Null);
        assert_eq!(hub.listener_count("nobody"), 0);
    }
}
