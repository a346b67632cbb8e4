//! Loading façade over the two-lane coordinator.
//!
//! A [`Loader`] runs load bodies on its [`Mutator`]'s Mutate lane, so a new
//! load preempts the one in flight, and mirrors the lifecycle into an
//! observable [`LoadState`]: a loading flag plus the last completed result.
//! Cancellation is never recorded as a result; it re-raises to the caller.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Result;
use crate::mutator::Mutator;

/// Observable lifecycle of a [`Loader`].
#[derive(Debug, Clone, Default)]
pub struct LoadState {
    /// True while a load body runs with loading notification enabled.
    pub is_loading: bool,
    /// Outcome of the last load that completed normally; `None` until then.
    /// Cancelled loads leave it untouched.
    pub last_result: Option<Result<()>>,
}

type FinishHook = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

/// Handle given to a load body for registering an on-finish hook.
///
/// The hook runs exactly once — on success, failure, or cancellation —
/// before the lane body finishes. Registering again replaces the previous
/// hook.
#[derive(Clone, Default)]
pub struct LoadScope {
    hook: FinishHook,
}

impl LoadScope {
    /// Register the on-finish hook for this load.
    pub fn on_finish(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

struct Inner {
    mutator: Mutator,
    state_tx: watch::Sender<LoadState>,
    loading_tx: watch::Sender<bool>,
}

impl Inner {
    fn set_loading(&self, loading: bool) {
        self.state_tx.send_modify(|state| state.is_loading = loading);
        self.loading_tx.send_if_modified(|current| {
            if *current == loading {
                false
            } else {
                *current = loading;
                true
            }
        });
    }

    fn record(&self, result: Result<()>) {
        self.state_tx
            .send_modify(|state| state.last_result = Some(result));
    }
}

/// Load coordinator: exclusive loads with observable state.
///
/// Cheap to clone; all clones share the same coordinator and state.
pub struct Loader {
    inner: Arc<Inner>,
}

impl Clone for Loader {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Loader {
    /// Create an idle loader.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                mutator: Mutator::new(),
                state_tx: watch::channel(LoadState::default()).0,
                loading_tx: watch::channel(false).0,
            }),
        }
    }

    /// Run a load with loading notification enabled.
    ///
    /// Preempts any load in flight (the preempted caller observes
    /// [`crate::Error::Cancelled`]). The body receives a [`LoadScope`] for
    /// registering an on-finish hook.
    pub async fn load<T, F, Fut>(&self, on_load: F) -> Result<T>
    where
        F: FnOnce(LoadScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.load_with(true, on_load).await
    }

    /// Run a load, choosing whether the loading flag is notified.
    pub async fn load_with<T, F, Fut>(&self, notify_loading: bool, on_load: F) -> Result<T>
    where
        F: FnOnce(LoadScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let inner = self.inner.clone();
        self.inner
            .mutator
            .mutate(run_load(inner, notify_loading, on_load))
            .await
    }

    /// Like [`Loader::load`], but fails with [`crate::Error::Cancelled`]
    /// instead of preempting when a load is in flight.
    pub async fn try_load<T, F, Fut>(&self, on_load: F) -> Result<T>
    where
        F: FnOnce(LoadScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_load_with(true, on_load).await
    }

    /// Non-preempting variant of [`Loader::load_with`].
    pub async fn try_load_with<T, F, Fut>(&self, notify_loading: bool, on_load: F) -> Result<T>
    where
        F: FnOnce(LoadScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let inner = self.inner.clone();
        self.inner
            .mutator
            .try_mutate(run_load(inner, notify_loading, on_load))
            .await
    }

    /// Cancel the load in flight, if any, and wait for it to finish.
    pub async fn cancel(&self) {
        self.inner.mutator.cancel_mutate().await;
    }

    /// Suspend until no load is in flight; no-op when idle.
    pub async fn await_idle(&self) {
        let mut rx = self.inner.loading_tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> LoadState {
        self.inner.state_tx.borrow().clone()
    }

    /// Returns true while a load body runs with loading notification.
    pub fn is_loading(&self) -> bool {
        *self.inner.loading_tx.borrow()
    }

    /// Observable state.
    pub fn state_watch(&self) -> watch::Receiver<LoadState> {
        self.inner.state_tx.subscribe()
    }

    /// Observable loading flag, duplicate-suppressed.
    pub fn loading_watch(&self) -> watch::Receiver<bool> {
        self.inner.loading_tx.subscribe()
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_load<T, F, Fut>(inner: Arc<Inner>, notify_loading: bool, on_load: F) -> Result<T>
where
    F: FnOnce(LoadScope) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let scope = LoadScope::default();
    let _finish = FinishGuard {
        inner: inner.clone(),
        hook: scope.hook.clone(),
        notify_loading,
    };
    if notify_loading {
        inner.set_loading(true);
    }
    let result = on_load(scope).await;
    match &result {
        Err(e) if e.is_cancelled() => {}
        Ok(_) => inner.record(Ok(())),
        Err(e) => inner.record(Err(e.clone())),
    }
    result
}

/// Runs the on-finish hook and clears the loading flag whether the load
/// body completes or is dropped.
struct FinishGuard {
    inner: Arc<Inner>,
    hook: FinishHook,
    notify_loading: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.notify_loading {
            self.inner.set_loading(false);
        }
    }
}
