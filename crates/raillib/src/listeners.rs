//! Listener registration for reconciled station events.
//!
//! Listeners register for one [`EventKind`] and are called from the
//! dispatcher's event task. The registry is read on every event and
//! written only on (un)registration, so it sits behind a
//! [`parking_lot::RwLock`]. Callbacks run after the lock is released and
//! may register or remove listeners themselves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use raillib_core::events::{EventKind, StationEvent};

/// Callback invoked with a reconciled event.
pub type Listener = Arc<dyn Fn(&StationEvent) + Send + Sync>;

/// Handle returned by [`ListenerRegistry::add`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

/// Registered listeners, keyed by event kind.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `kind`.
    pub fn add(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(Entry { id, kind, listener });
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Call every listener registered for the event's kind. Returns how
    /// many were called.
    pub fn notify(&self, event: &StationEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| Arc::clone(&e.listener))
            .collect();
        for listener in &targets {
            listener(event);
        }
        targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Arc::new(move |_: &StationEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn only_matching_kind_is_called() {
        let registry = ListenerRegistry::new();
        let (power, power_listener) = counter();
        let (sensor, sensor_listener) = counter();
        registry.add(EventKind::Power, power_listener);
        registry.add(EventKind::Sensor, sensor_listener);

        assert_eq!(registry.notify(&StationEvent::PowerChanged { on: true }), 1);
        assert_eq!(power.load(Ordering::SeqCst), 1);
        assert_eq!(sensor.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let registry = ListenerRegistry::new();
        let (count, listener) = counter();
        let id = registry.add(EventKind::Power, listener);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());

        registry.notify(&StationEvent::PowerChanged { on: false });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_unregister_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let slot: Arc<RwLock<Option<ListenerId>>> = Arc::new(RwLock::new(None));
        let (r, s) = (Arc::clone(&registry), Arc::clone(&slot));
        let id = registry.add(
            EventKind::Connection,
            Arc::new(move |_: &StationEvent| {
                if let Some(id) = *s.read() {
                    r.remove(id);
                }
            }),
        );
        *slot.write() = Some(id);

        assert_eq!(registry.notify(&StationEvent::Connected), 1);
        assert_eq!(registry.len(), 0);
    }
}
