//! Per-key single-flight deduplication.
//!
//! A [`KeyedSingleFlight`] registers a transient [`SingleFlight`] per key
//! for the duration of one execution: the first caller for a key runs its
//! body, concurrent callers for the same key join that run and drop their
//! own bodies unused, and the registration is removed when the run ends —
//! by completion, failure, or cancellation. A per-key loading flag backed
//! by [`KeyedState`] brackets each execution.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::affinity::Affinity;
use crate::error::Result;
use crate::keyed_state::{KeyedState, Observation};
use crate::single_flight::SingleFlight;

/// Keyed single-flight deduplication with per-key loading flags.
///
/// Cheap to clone; all clones share the same registrations.
pub struct KeyedSingleFlight<K, T> {
    inner: Arc<Inner<K, T>>,
}

struct Inner<K, T> {
    flights: Mutex<HashMap<K, SingleFlight<T>>>,
    syncing: KeyedState<K, bool>,
    affinity: Affinity,
}

impl<K, T> Clone for KeyedSingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Entry<T> {
    Join(SingleFlight<T>),
    Run(SingleFlight<T>),
}

impl<K, T> KeyedSingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_affinity(Affinity::inherit())
    }

    /// Like [`KeyedSingleFlight::new`] with an explicit execution affinity
    /// for the bodies.
    pub fn with_affinity(affinity: Affinity) -> Self {
        Self {
            inner: Arc::new(Inner {
                flights: Mutex::new(HashMap::new()),
                syncing: KeyedState::new(),
                affinity,
            }),
        }
    }

    /// Execute `body` for `key`, or join the key's execution already in
    /// flight.
    ///
    /// Only the caller that creates the key's registration consumes its
    /// body; joiners' bodies are dropped unused and every caller of the run
    /// receives the same outcome.
    pub async fn sync<F>(&self, key: K, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let entry = {
            let mut flights = self.inner.flights.lock();
            match flights.entry(key.clone()) {
                MapEntry::Occupied(occupied) => Entry::Join(occupied.get().clone()),
                MapEntry::Vacant(vacant) => {
                    let flight = self.make_flight(key.clone(), body);
                    vacant.insert(flight.clone());
                    Entry::Run(flight)
                }
            }
        };
        match entry {
            Entry::Join(flight) => flight.sync().await,
            Entry::Run(flight) => {
                let _cleanup = Deregister {
                    inner: &self.inner,
                    key,
                    flight: flight.clone(),
                };
                flight.sync().await
            }
        }
    }

    /// Observable loading flag for `key`: true strictly while the key's
    /// execution is in flight.
    pub fn syncing(&self, key: K) -> Observation<K, bool> {
        self.inner.syncing.observe(key, false)
    }

    fn make_flight<F>(&self, key: K, body: F) -> SingleFlight<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let syncing = self.inner.syncing.clone();
        let wrapped = async move {
            syncing.update(key.clone(), true);
            let _flag = FlagOff {
                syncing,
                key: Some(key),
            };
            body.await
        };
        SingleFlight::once(self.inner.affinity.clone(), Box::pin(wrapped))
    }
}

impl<K, T> Default for KeyedSingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Sets-and-releases the key's loading flag when the execution ends,
/// regardless of outcome.
struct FlagOff<K: Eq + Hash + Clone> {
    syncing: KeyedState<K, bool>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone> Drop for FlagOff<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.syncing.update_and_release(key, false);
        }
    }
}

/// Removes the key's registration when the run ends, if it is still this
/// run's instance.
struct Deregister<'a, K: Eq + Hash, T> {
    inner: &'a Inner<K, T>,
    key: K,
    flight: SingleFlight<T>,
}

impl<K: Eq + Hash, T> Drop for Deregister<'_, K, T> {
    fn drop(&mut self) {
        let mut flights = self.inner.flights.lock();
        let ours = flights
            .get(&self.key)
            .is_some_and(|current| current.same_instance(&self.flight));
        if ours {
            flights.remove(&self.key);
        }
    }
}
