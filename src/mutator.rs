//! Two-lane exclusive task coordination.
//!
//! A [`Mutator`] serializes caller-supplied bodies on one FIFO execution
//! lock across two lanes. Mutate-lane tasks are individually tracked:
//! starting a new one cancels and joins the previous one, and
//! [`Mutator::cancel_mutate`] cancels the tracked task on demand.
//! Effect-lane tasks are never cancelled by the coordinator; concurrent
//! effects simply queue on the lock in arrival order.
//!
//! Bodies run inline in the calling task, so dropping the caller's future
//! cancels the lane body directly. Nested lane calls on the same coordinator
//! are detected through a task-local marker and fail fast without queuing.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Execution lane of a coordinator body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Tracked and cancellable; at most one per coordinator.
    Mutate,
    /// Untracked; only the caller's own cancellation affects it.
    Effect,
}

#[derive(Debug, Clone, Copy)]
struct LaneTag {
    mutator: u64,
    lane: Lane,
}

tokio::task_local! {
    /// Marker for the coordinator lane active in the current task chain.
    static ACTIVE_LANE: LaneTag;
}

static NEXT_MUTATOR_ID: AtomicU64 = AtomicU64::new(0);

/// Record of the currently tracked Mutate task.
struct Tracked {
    seq: u64,
    cancel: CancellationToken,
    /// Fires when the tracked task's future completes or is dropped.
    done: CancellationToken,
}

/// Two-lane mutual-exclusion and cancellation engine.
pub struct Mutator {
    id: u64,
    exec: AsyncMutex<()>,
    tracked: Mutex<Option<Tracked>>,
    next_seq: AtomicU64,
}

impl Mutator {
    /// Create an idle coordinator.
    pub fn new() -> Self {
        Self {
            id: NEXT_MUTATOR_ID.fetch_add(1, Ordering::Relaxed),
            exec: AsyncMutex::new(()),
            tracked: Mutex::new(None),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Run `body` on the Mutate lane.
    ///
    /// Cancels and joins any previously tracked Mutate task before queuing
    /// on the execution lock; of two racing calls the later always preempts
    /// the earlier. Cancellation surfaces as [`Error::Cancelled`]; body
    /// errors propagate as-is. Fails with [`Error::AlreadyInMutate`] or
    /// [`Error::AlreadyInEffect`] when called from inside one of this
    /// coordinator's own lane bodies.
    pub async fn mutate<T, F>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_not_active()?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let prev = self.tracked.lock().replace(Tracked {
            seq,
            cancel: cancel.clone(),
            done: done.clone(),
        });
        if let Some(prev) = &prev {
            // Cancel synchronously, before our own cancellable region begins,
            // so a chain of racing calls cannot leave an ancestor running.
            log::debug!("mutator {}: preempting tracked mutate task", self.id);
            prev.cancel.cancel();
        }

        let _guard = TrackedGuard {
            mutator: self,
            seq,
            done,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                if let Some(prev) = prev {
                    prev.done.cancelled().await;
                }
                let _exec = self.exec.lock().await;
                ACTIVE_LANE
                    .scope(
                        LaneTag {
                            mutator: self.id,
                            lane: Lane::Mutate,
                        },
                        body,
                    )
                    .await
            } => result,
        }
    }

    /// Like [`Mutator::mutate`], but fails with [`Error::Cancelled`] instead
    /// of preempting when a Mutate task is currently tracked.
    pub async fn try_mutate<T, F>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_not_active()?;
        if self.is_mutating() {
            return Err(Error::Cancelled);
        }
        self.mutate(body).await
    }

    /// Run `body` on the Effect lane.
    ///
    /// Queues on the same FIFO execution lock but is never cancelled by the
    /// coordinator; concurrent effects run to completion in arrival order.
    pub async fn effect<T, F>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_not_active()?;
        let _exec = self.exec.lock().await;
        ACTIVE_LANE
            .scope(
                LaneTag {
                    mutator: self.id,
                    lane: Lane::Effect,
                },
                body,
            )
            .await
    }

    /// Cancel the currently tracked Mutate task and wait for it to finish.
    ///
    /// No-op when no Mutate task is tracked. Never touches an in-flight
    /// Effect.
    pub async fn cancel_mutate(&self) {
        let prev = self.tracked.lock().take();
        if let Some(prev) = prev {
            log::debug!("mutator {}: cancelling tracked mutate task", self.id);
            prev.cancel.cancel();
            prev.done.cancelled().await;
        }
    }

    /// Returns true if a Mutate task is currently tracked.
    pub fn is_mutating(&self) -> bool {
        self.tracked.lock().is_some()
    }

    fn ensure_not_active(&self) -> Result<()> {
        match ACTIVE_LANE.try_with(|tag| *tag).ok() {
            Some(tag) if tag.mutator == self.id => Err(match tag.lane {
                Lane::Mutate => Error::AlreadyInMutate,
                Lane::Effect => Error::AlreadyInEffect,
            }),
            _ => Ok(()),
        }
    }
}

impl Default for Mutator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("mutating", &self.is_mutating())
            .finish()
    }
}

/// Untracks the record (if still current) and fires `done` whether the
/// mutate future completes or is dropped.
struct TrackedGuard<'a> {
    mutator: &'a Mutator,
    seq: u64,
    done: CancellationToken,
}

impl Drop for TrackedGuard<'_> {
    fn drop(&mut self) {
        {
            let mut tracked = self.mutator.tracked.lock();
            if tracked.as_ref().is_some_and(|t| t.seq == self.seq) {
                *tracked = None;
            }
        }
        self.done.cancel();
    }
}
