//! Per-job listener registry.
//!
//! One ordered callback list per [`EventKind`]. Insertion order is call order,
//! the same listener registered twice fires twice, and removal matches by
//! reference identity (`Arc` pointer), never by structural equality.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::status::{EventKind, JobEvent};

/// Callback invoked with each delivered event.
pub type Listener = Arc<dyn Fn(&JobEvent) + Send + Sync>;

/// Ordered callback lists keyed by event kind.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener` to the list for `kind`.
    pub fn add(&self, kind: EventKind, listener: Listener) {
        self.listeners.lock().entry(kind).or_default().push(listener);
    }

    /// Remove every registration of `listener` under `kind`.
    pub fn remove(&self, kind: EventKind, listener: &Listener) {
        if let Some(list) = self.listeners.lock().get_mut(&kind) {
            list.retain(|l| !same_listener(l, listener));
        }
    }

    /// Remove all listeners of all kinds.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Number of registrations under `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every listener of its kind, in registration order.
    ///
    /// The list is snapshotted before calling out, so listeners may call
    /// back into the registry (e.g. remove themselves).
    pub fn fire(&self, event: &JobEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for listener in snapshot {
            listener(event);
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_struct("ListenerRegistry")
            .field("status", &listeners.get(&EventKind::Status).map_or(0, Vec::len))
            .field("data", &listeners.get(&EventKind::Data).map_or(0, Vec::len))
            .field("log", &listeners.get(&EventKind::Log).map_or(0, Vec::len))
            .finish()
    }
}

/// Identity comparison on the data pointer only.
fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
