//! Cancellable broadcast registration for suspended callers.
//!
//! A [`WaiterGroup`] holds a set of suspended callers and resumes all of
//! them at once with a shared outcome. Resuming drains the set atomically,
//! so callers that register afterward belong to a new generation and are
//! untouched. A caller whose own future is dropped while registered removes
//! itself from the set without disturbing the others.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// A broadcast rendezvous for suspended callers.
pub struct WaiterGroup<T> {
    waiters: Mutex<Vec<Waiter<T>>>,
    next_id: AtomicU64,
}

struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<Result<T>>,
}

impl<T> WaiterGroup<T> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Suspend until the group is resumed, failed, or cancelled.
    ///
    /// Dropping the returned future removes the caller from the group with
    /// no effect on other waiters.
    pub async fn register(&self) -> Result<T> {
        self.enlist().await
    }

    /// Insert a waiter synchronously and return the awaitable half.
    ///
    /// Lets callers enlist while holding their own state lock, so a
    /// check-then-register sequence cannot race a concurrent drain.
    pub(crate) fn enlist(&self) -> Registration<'_, T> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().push(Waiter { id, tx });
        Registration { group: self, id, rx }
    }

    /// Resume every currently registered waiter with `value`.
    pub fn resume_all(&self, value: T)
    where
        T: Clone,
    {
        for waiter in self.drain() {
            let _ = waiter.tx.send(Ok(value.clone()));
        }
    }

    /// Fail every currently registered waiter with `error`.
    pub fn resume_all_err(&self, error: Error) {
        for waiter in self.drain() {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }

    /// Cancel every currently registered waiter's suspension.
    pub fn cancel_all(&self, cause: Option<Error>) {
        self.resume_all_err(cause.unwrap_or(Error::Cancelled));
    }

    /// Number of currently registered waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Returns true if no waiter is registered.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    // Swap the waiter set for an empty one; resumption happens outside the lock.
    fn drain(&self) -> Vec<Waiter<T>> {
        std::mem::take(&mut *self.waiters.lock())
    }
}

impl<T> Default for WaiterGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A single pending registration in a [`WaiterGroup`].
pub(crate) struct Registration<'a, T> {
    group: &'a WaiterGroup<T>,
    id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Registration<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped without resuming: the group itself went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        let mut waiters = self.group.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.id == self.id) {
            waiters.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tokio::task::yield_now;

    use super::*;

    async fn settle<T>(group: &WaiterGroup<T>, count: usize) {
        while group.len() < count {
            yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_resume_all() {
        let group = Arc::new(WaiterGroup::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..3 {
            let group = group.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(group.register().await);
            });
        }

        settle(&group, 3).await;
        group.resume_all(1);
        // A second resume belongs to a new generation and reaches nobody.
        group.resume_all(2);

        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().unwrap(), 1);
        }
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_resume_all_err() {
        let group = Arc::new(WaiterGroup::<i32>::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..3 {
            let group = group.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(group.register().await);
            });
        }

        settle(&group, 3).await;
        group.resume_all_err(Error::operation("broadcast failure"));

        for _ in 0..3 {
            let err = rx.recv().await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "operation failed: broadcast failure");
        }
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let group = Arc::new(WaiterGroup::<i32>::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..2 {
            let group = group.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(group.register().await);
            });
        }

        settle(&group, 2).await;
        group.cancel_all(None);

        for _ in 0..2 {
            assert!(rx.recv().await.unwrap().unwrap_err().is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_cancel_all_with_cause() {
        let group = Arc::new(WaiterGroup::<i32>::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = {
            let group = group.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(group.register().await);
            })
        };

        settle(&group, 1).await;
        group.cancel_all(Some(Error::operation("shutting down")));

        let err = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "operation failed: shutting down");
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_others_untouched() {
        let group = Arc::new(WaiterGroup::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let doomed = {
            let group = group.clone();
            tokio::spawn(async move {
                let _ = group.register().await;
            })
        };
        let survivor = {
            let group = group.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(group.register().await);
            })
        };

        settle(&group, 2).await;
        doomed.abort();
        let _ = doomed.await;
        assert_eq!(group.len(), 1);

        group.resume_all(7);
        assert_eq!(rx.recv().await.unwrap().unwrap(), 7);
        survivor.await.unwrap();
    }

    #[tokio::test]
    async fn test_register_after_drain_is_new_generation() {
        let group = Arc::new(WaiterGroup::new());
        group.resume_all(1);

        let late = {
            let group = group.clone();
            tokio::spawn(async move { group.register().await })
        };
        settle(&group, 1).await;
        group.resume_all(2);

        assert_eq!(late.await.unwrap().unwrap(), 2);
    }
}
