//! Client-side watcher registry.
//!
//! Tracks which event keys this connection is subscribed to and fans
//! incoming notifications out to their handlers. The bindings outlive any
//! single connection generation: after a reconnect the supervisor re-issues
//! WATCH for every live key before the connection reports Ready.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rmpv::Value;

/// Callback invoked with `(key, value)` for every notification.
///
/// Handlers run on the reader task; per-key arrival order is delivery order.
/// They must not block.
pub type WatchHandler = std::sync::Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle identifying one registered watcher.
#[derive(Debug)]
pub struct WatchToken {
    key: String,
    id: u64,
}

impl WatchToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Entry {
    id: u64,
    handler: WatchHandler,
}

pub(crate) struct WatcherRegistry {
    bindings: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl WatcherRegistry {
    pub(crate) fn new() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.bindings.lock().expect("watcher lock poisoned")
    }

    /// Record a binding. The second return value is true when this is the
    /// first handler for the key, i.e. a WATCH must go on the wire.
    pub(crate) fn register(&self, key: &str, handler: WatchHandler) -> (WatchToken, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut bindings = self.lock();
        let entries = bindings.entry(key.to_string()).or_default();
        let first = entries.is_empty();
        entries.push(Entry { id, handler });
        (
            WatchToken {
                key: key.to_string(),
                id,
            },
            first,
        )
    }

    /// Remove a binding. Returns true when the key has no handlers left and
    /// an UNWATCH should go on the wire.
    pub(crate) fn unregister(&self, token: &WatchToken) -> bool {
        let mut bindings = self.lock();
        let Some(entries) = bindings.get_mut(&token.key) else {
            return false;
        };
        entries.retain(|e| e.id != token.id);
        if entries.is_empty() {
            bindings.remove(&token.key);
            true
        } else {
            false
        }
    }

    /// Fan an event out to the key's handlers. Returns true when at least
    /// one handler received it (the reader then acknowledges with WATCH).
    pub(crate) fn dispatch(&self, key: &str, value: &Value) -> bool {
        // Handlers are user code: clone them out so the lock is not held
        // while they run.
        let handlers: Vec<WatchHandler> = {
            let bindings = self.lock();
            match bindings.get(key) {
                Some(entries) => entries.iter().map(|e| e.handler.clone()).collect(),
                None => return false,
            }
        };
        for handler in &handlers {
            handler(key, value);
        }
        !handlers.is_empty()
    }

    /// Keys with live bindings, for resubscription after reconnect.
    pub(crate) fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counting_handler(counter: Arc<std::sync::atomic::AtomicU64>) -> WatchHandler {
        Arc::new(move |_key, _value| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_first_and_last_binding_flags() {
        let registry = WatcherRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));

        let (t1, first) = registry.register("k", counting_handler(counter.clone()));
        assert!(first);
        let (t2, first) = registry.register("k", counting_handler(counter.clone()));
        assert!(!first);

        assert!(!registry.unregister(&t1));
        assert!(registry.unregister(&t2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_fans_out() {
        let registry = WatcherRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));
        registry.register("k", counting_handler(counter.clone()));
        registry.register("k", counting_handler(counter.clone()));

        assert!(registry.dispatch("k", &Value::from(1)));
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        assert!(!registry.dispatch("other", &Value::Nil));
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_keys_lists_live_bindings() {
        let registry = WatcherRegistry::new();
        registry.register("a", Arc::new(|_, _| {}));
        registry.register("b", Arc::new(|_, _| {}));
        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_unregister_with_stale_token() {
        let registry = WatcherRegistry::new();
        let (token, _) = registry.register("k", Arc::new(|_, _| {}));
        assert!(registry.unregister(&token));
        // Unregistering twice is a no-op.
        assert!(!registry.unregister(&token));
    }
}
