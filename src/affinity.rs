//! Execution affinity for operation bodies.
//!
//! The one configuration point of the crate: where single-flight operation
//! bodies execute. The default keeps them inline in the runner's own task;
//! an explicit runtime handle moves them onto that runtime with
//! abort-on-drop linkage, so cancelling the runner still cancels the body.

use std::future::Future;

use tokio::runtime::Handle;
use tokio_util::task::AbortOnDropHandle;

use crate::error::{Error, Result};

/// Where operation bodies run.
#[derive(Clone, Debug, Default)]
pub struct Affinity {
    handle: Option<Handle>,
}

impl Affinity {
    /// Run bodies inline in the calling task. The default.
    pub fn inherit() -> Self {
        Self { handle: None }
    }

    /// Prefer the runtime active at construction time, else run inline.
    pub fn current() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    /// Pin bodies to the given runtime.
    pub fn runtime(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match &self.handle {
            None => fut.await,
            Some(handle) => {
                let task = AbortOnDropHandle::new(handle.spawn(fut));
                match task.await {
                    Ok(outcome) => outcome,
                    Err(join) if join.is_cancelled() => Err(Error::Cancelled),
                    Err(join) => std::panic::resume_unwind(join.into_panic()),
                }
            }
        }
    }
}
