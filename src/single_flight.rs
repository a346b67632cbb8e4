//! Single-flight deduplication with broadcast results.
//!
//! A [`SingleFlight`] wraps one operation so that any number of concurrent
//! [`SingleFlight::sync`] callers share exactly one execution. The caller
//! that finds the instance idle runs the operation; everyone else suspends
//! on a [`WaiterGroup`] and receives the same outcome. Ordinary failures are
//! captured and broadcast like successes; cancellation is never broadcast as
//! a result.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::affinity::Affinity;
use crate::error::{Error, Result};
use crate::waiters::{Registration, WaiterGroup};

pub(crate) type BoxFut<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

tokio::task_local! {
    /// Instance id of the single-flight operation running in this task chain.
    static ACTIVE_SYNC: u64;
}

static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(0);

enum Op<T> {
    /// Long-lived instance: each idle `sync` invokes the factory afresh.
    Factory(Box<dyn Fn() -> BoxFut<T> + Send + Sync>),
    /// Single-use instance: one future, with the generation outcome cached
    /// for arrivals that show up after it completed.
    Once {
        fut: Mutex<Option<BoxFut<T>>>,
        last: Mutex<Option<Result<T>>>,
    },
}

struct Inner<T> {
    id: u64,
    running: Mutex<bool>,
    waiters: WaiterGroup<T>,
    syncing_tx: watch::Sender<bool>,
    affinity: Affinity,
    op: Op<T>,
}

/// Collapses concurrent identical operations into one execution.
///
/// Cheap to clone; all clones share the same state.
pub struct SingleFlight<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Entry<'a, T> {
    Run,
    Join(Registration<'a, T>),
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    /// Wrap `operation`, to be executed at most once at a time.
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_affinity(Affinity::inherit(), operation)
    }

    /// Like [`SingleFlight::new`] with an explicit execution affinity for
    /// the operation body.
    pub fn with_affinity<F, Fut>(affinity: Affinity, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::build(
            affinity,
            Op::Factory(Box::new(move || -> BoxFut<T> { Box::pin(operation()) })),
        )
    }

    /// Single-use instance around one future; used for transient per-key
    /// registrations.
    pub(crate) fn once(affinity: Affinity, fut: BoxFut<T>) -> Self {
        Self::build(
            affinity,
            Op::Once {
                fut: Mutex::new(Some(fut)),
                last: Mutex::new(None),
            },
        )
    }

    fn build(affinity: Affinity, op: Op<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed),
                running: Mutex::new(false),
                waiters: WaiterGroup::new(),
                syncing_tx: watch::channel(false).0,
                affinity,
                op,
            }),
        }
    }

    /// Execute the operation, or join an execution already in flight.
    ///
    /// Every caller of the same run receives an identical outcome. Fails
    /// with [`Error::NestedInvocation`] when called from inside this
    /// instance's own running operation; a waiter whose future is dropped
    /// leaves the run and the other waiters untouched.
    pub async fn sync(&self) -> Result<T> {
        self.ensure_not_nested()?;
        // Checking `running` and enlisting happen under one lock so a
        // would-be waiter can never miss the drain that resumes it.
        let entry = {
            let mut running = self.inner.running.lock();
            if *running {
                Entry::Join(self.inner.waiters.enlist())
            } else {
                *running = true;
                Entry::Run
            }
        };
        match entry {
            Entry::Join(registration) => registration.await,
            Entry::Run => self.run().await,
        }
    }

    /// Suspend until no execution is in flight; no-op when idle.
    pub async fn await_idle(&self) -> Result<()> {
        self.ensure_not_nested()?;
        let mut rx = self.inner.syncing_tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Observable mirror of the running state.
    pub fn syncing(&self) -> watch::Receiver<bool> {
        self.inner.syncing_tx.subscribe()
    }

    /// Returns true while an execution is in flight.
    pub fn is_syncing(&self) -> bool {
        *self.inner.syncing_tx.borrow()
    }

    async fn run(&self) -> Result<T> {
        let inner = &*self.inner;
        let _ = inner.syncing_tx.send_replace(true);

        let fut = match &inner.op {
            Op::Factory(factory) => factory(),
            Op::Once { fut, last } => match fut.lock().take() {
                Some(fut) => fut,
                None => {
                    // The single-use operation already ran to an outcome;
                    // hand that outcome to the late arrival.
                    let outcome = match last.lock().clone() {
                        Some(outcome) => outcome,
                        None => unreachable!("single-use operation consumed without an outcome"),
                    };
                    self.finish(outcome.clone());
                    return outcome;
                }
            },
        };

        let mut guard = RunGuard {
            flight: self,
            armed: true,
        };
        let outcome = inner.affinity.run(ACTIVE_SYNC.scope(inner.id, fut)).await;
        guard.armed = false;
        drop(guard);

        match outcome {
            Err(Error::NestedInvocation) => {
                // The single-outcome contract broke: cancel the waiters and
                // re-raise instead of broadcasting a result.
                self.abort_run();
                Err(Error::NestedInvocation)
            }
            outcome => {
                self.finish(outcome.clone());
                outcome
            }
        }
    }

    fn finish(&self, outcome: Result<T>) {
        self.record_last(outcome.clone());
        *self.inner.running.lock() = false;
        match &outcome {
            Ok(value) => self.inner.waiters.resume_all(value.clone()),
            Err(error) => self.inner.waiters.resume_all_err(error.clone()),
        }
        let _ = self.inner.syncing_tx.send_replace(false);
    }

    fn ensure_not_nested(&self) -> Result<()> {
        if ACTIVE_SYNC
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
        {
            return Err(Error::NestedInvocation);
        }
        Ok(())
    }
}

impl<T> SingleFlight<T> {
    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn abort_run(&self) {
        self.record_last(Err(Error::Cancelled));
        *self.inner.running.lock() = false;
        self.inner.waiters.cancel_all(None);
        let _ = self.inner.syncing_tx.send_replace(false);
    }

    fn record_last(&self, outcome: Result<T>) {
        if let Op::Once { last, .. } = &self.inner.op {
            *last.lock() = Some(outcome);
        }
    }
}

/// Resumes the waiters with `Cancelled` if the runner's future is dropped
/// mid-run, so a cancelled runner never strands its joiners.
struct RunGuard<'a, T> {
    flight: &'a SingleFlight<T>,
    armed: bool,
}

impl<T> Drop for RunGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.flight.abort_run();
        }
    }
}
