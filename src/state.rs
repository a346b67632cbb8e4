//! Plain observable-state container.

use std::sync::Arc;

use tokio::sync::watch;

/// A mutable value with change notification.
///
/// The minimal state holder consumed by view-model-style collaborators;
/// no dedup or coordination semantics of its own.
pub struct StateCell<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> StateCell<T> {
    /// Create a cell holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            tx: Arc::new(watch::channel(initial).0),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify observers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate the value in place and notify observers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Observe the value.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}
