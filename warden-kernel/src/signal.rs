//! Named in-process signal bus for lifecycle events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<String, Vec<(u64, Callback)>>>,
    // Serializes notifications so listeners observe one event at a time.
    notifying: Mutex<()>,
    next_id: AtomicU64,
}

/// Event bus mapping event names to ordered listener lists.
///
/// An explicit instance owned by the orchestrator and handed to
/// subscribers; notifying an unknown event is a no-op. Callbacks must not
/// block (post long work to the task manager) and must not notify the same
/// event they handle.
#[derive(Clone, Default)]
pub struct SignalDispatcher {
    registry: Arc<Registry>,
}

impl SignalDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `event`.
    ///
    /// The returned handle unsubscribes when dropped. A registration made
    /// while a notification is running takes effect from the next notify.
    #[must_use]
    pub fn register(
        &self,
        event: impl Into<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> SignalHandle {
        let event = event.into();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        let mut listeners = lock(&self.registry.listeners);
        listeners
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        SignalHandle {
            event,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Invokes the listeners currently registered for `event`,
    /// synchronously and in registration order.
    pub fn notify(&self, event: &str) {
        let snapshot: Vec<Callback> = lock(&self.registry.listeners)
            .get(event)
            .map(|listeners| listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        if snapshot.is_empty() {
            trace!(event, "no listeners for signal");
            return;
        }

        let _serial = lock(&self.registry.notifying);
        for callback in snapshot {
            callback();
        }
    }
}

/// Subscription handle; dropping it unsubscribes the listener.
pub struct SignalHandle {
    event: String,
    id: u64,
    registry: Weak<Registry>,
}

impl Drop for SignalHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut listeners = lock(&registry.listeners);
            if let Some(entries) = listeners.get_mut(&self.event) {
                entries.retain(|(id, _)| *id != self.id);
                if entries.is_empty() {
                    listeners.remove(&self.event);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_run_in_registration_order() {
        let dispatcher = SignalDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let _first = dispatcher.register("reload", {
            let order = Arc::clone(&order);
            move || order.lock().unwrap().push(1)
        });
        let _second = dispatcher.register("reload", {
            let order = Arc::clone(&order);
            move || order.lock().unwrap().push(2)
        });

        dispatcher.notify("reload");
        assert_eq!(*order.lock().unwrap(), [1, 2]);
    }

    #[test]
    fn unknown_event_is_a_no_op() {
        let dispatcher = SignalDispatcher::new();
        dispatcher.notify("never-registered");
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let dispatcher = SignalDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = dispatcher.register("shutdown", {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        dispatcher.notify("shutdown");
        drop(handle);
        dispatcher.notify("shutdown");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_during_notify_waits_for_the_next_one() {
        let dispatcher = SignalDispatcher::new();
        let late_calls = Arc::new(AtomicUsize::new(0));
        let late_handle = Arc::new(Mutex::new(None));

        let _registrar = dispatcher.register("reload", {
            let dispatcher = dispatcher.clone();
            let late_calls = Arc::clone(&late_calls);
            let late_handle = Arc::clone(&late_handle);
            move || {
                let handle = dispatcher.register("reload", {
                    let late_calls = Arc::clone(&late_calls);
                    move || {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                    }
                });
                late_handle.lock().unwrap().get_or_insert(handle);
            }
        });

        dispatcher.notify("reload");
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        dispatcher.notify("reload");
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }
}
