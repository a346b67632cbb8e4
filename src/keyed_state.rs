//! Keyed, reference-counted broadcast state.
//!
//! A [`KeyedState`] lazily creates one broadcast cell per key. Cells are
//! reclaimed by reference counting over live observations, not by call
//! counts: a cell disposes when its last observer is gone and no pinning
//! update keeps it alive. [`KeyedState::update`] pins a cell;
//! [`KeyedState::update_and_release`] writes and immediately makes the cell
//! reclaimable again.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Reference-counted, lazily created per-key broadcast state.
///
/// Cheap to clone; all clones share the same cells.
pub struct KeyedState<K, T> {
    inner: Arc<Inner<K, T>>,
}

struct Inner<K, T> {
    // Single-writer discipline: every map and cell mutation happens under
    // this lock, and caller code never runs while it is held.
    cells: Mutex<HashMap<K, Cell<T>>>,
}

struct Cell<T> {
    tx: watch::Sender<T>,
    pinned: bool,
}

impl<K, T> Clone for KeyedState<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone, T: Clone + PartialEq> KeyedState<K, T> {
    /// Create an empty map of cells.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cells: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to `key`, creating its cell from `default` if absent.
    ///
    /// The returned observation is a duplicate-suppressing, latest-value
    /// sequence shared with every other observer of the key. Dropping it
    /// re-evaluates the cell's disposal.
    pub fn observe(&self, key: K, default: T) -> Observation<K, T> {
        let rx = {
            let mut cells = self.inner.cells.lock();
            let cell = cells.entry(key.clone()).or_insert_with(|| Cell {
                tx: watch::channel(default).0,
                pinned: false,
            });
            cell.tx.subscribe()
        };
        Observation {
            inner: self.inner.clone(),
            key,
            rx: Some(rx),
            primed: false,
        }
    }

    /// Create-or-set the value for `key` and pin the cell against disposal.
    pub fn update(&self, key: K, value: T) {
        let mut cells = self.inner.cells.lock();
        match cells.entry(key) {
            MapEntry::Occupied(mut entry) => {
                let cell = entry.get_mut();
                cell.pinned = true;
                set_value(&cell.tx, value);
            }
            MapEntry::Vacant(entry) => {
                entry.insert(Cell {
                    tx: watch::channel(value).0,
                    pinned: true,
                });
            }
        }
    }

    /// Set the value for `key` and immediately make the cell reclaimable.
    ///
    /// With no live observer the cell disposes on the spot: a later observer
    /// reconstructs from its own default, not from this value.
    pub fn update_and_release(&self, key: K, value: T) {
        let mut cells = self.inner.cells.lock();
        match cells.entry(key) {
            MapEntry::Occupied(mut entry) => {
                {
                    let cell = entry.get_mut();
                    cell.pinned = false;
                    set_value(&cell.tx, value);
                }
                if entry.get().tx.receiver_count() == 0 {
                    entry.remove();
                }
            }
            MapEntry::Vacant(_) => {
                // No cell and no observers: the write would be reclaimed
                // before anyone could see it, so no cell is created.
            }
        }
    }
}

impl<K: Eq + Hash + Clone, T: Clone + PartialEq> Default for KeyedState<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn set_value<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

/// Live subscription to one keyed cell.
pub struct Observation<K: Eq + Hash, T> {
    inner: Arc<Inner<K, T>>,
    key: K,
    // Dropped explicitly before the disposal check, so the receiver count
    // the check reads no longer includes this observation.
    rx: Option<watch::Receiver<T>>,
    primed: bool,
}

impl<K: Eq + Hash, T: Clone> Observation<K, T> {
    /// The cell's current value.
    pub fn current(&self) -> T {
        match &self.rx {
            Some(rx) => rx.borrow().clone(),
            None => unreachable!("observation used after drop"),
        }
    }

    /// The next value of the sequence: the current value on first call, then
    /// each subsequent distinct value. Returns `None` only if the cell map
    /// itself went away.
    pub async fn next(&mut self) -> Option<T> {
        let primed = self.primed;
        let rx = self.rx.as_mut()?;
        if !primed {
            self.primed = true;
            return Some(rx.borrow_and_update().clone());
        }
        match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

impl<K: Eq + Hash, T> Drop for Observation<K, T> {
    fn drop(&mut self) {
        self.rx = None;
        let mut cells = self.inner.cells.lock();
        let disposable = cells
            .get(&self.key)
            .is_some_and(|cell| !cell.pinned && cell.tx.receiver_count() == 0);
        if disposable {
            cells.remove(&self.key);
        }
    }
}
