//! Listener fan-out.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// An ordered set of listeners.
///
/// Calls go to a snapshot of the registered listeners, so a listener may
/// register another one from inside a callback. A panicking listener is
/// logged and skipped; the rest still get the event.
pub struct ListenerRegistry<T: ?Sized> {
    listeners: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<T>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invoke `f` on every listener in registration order.
    pub fn notify(&self, f: impl Fn(&T)) {
        let snapshot: Vec<Arc<T>> = self.listeners.read().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(&listener))).is_err() {
                error!("Listener panicked");
            }
        }
    }
}

impl<T: ?Sized> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
