//! Runtime-agnostic async utilities
//!
//! This crate provides a spawning trait and abortable task handles that work
//! across async runtimes without coupling callers to a specific one. The
//! migration engine uses it to run its background pollers and watchdogs.
//!
//! # Examples
//!
//! ```no_run
//! use async_runtime_compat::prelude::*;
//! use std::time::Duration;
//!
//! fn start<S: Spawner>(spawner: &S) -> TaskHandle {
//!     let handle = spawner.spawn_abortable(Box::pin(async {
//!         sleep(Duration::from_secs(60)).await;
//!     }));
//!     handle
//! }
//!
//! # #[cfg(feature = "smol")]
//! smol::block_on(async {
//!     let handle = start(&SmolSpawner);
//!     handle.abort();
//! });
//! ```

#![warn(missing_docs)]

use futures::future::{AbortHandle, AbortRegistration, Abortable};
use std::future::Future;
use std::pin::Pin;

/// Boxed future accepted by [`Spawner`].
pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A spawner that can spawn futures on an async runtime
pub trait Spawner: Send + Sync {
    /// Spawn a future on the runtime
    ///
    /// The future will run to completion in the background.
    fn spawn(&self, future: BoxTask);

    /// Spawn a future that can later be cancelled through the returned handle
    ///
    /// Cancellation is cooperative: the task stops at its next suspension
    /// point after [`TaskHandle::abort`] is called.
    fn spawn_abortable(&self, future: BoxTask) -> TaskHandle {
        let (handle, registration) = TaskHandle::new_pair();
        self.spawn_registered(future, registration);
        handle
    }

    /// Spawn a future controlled by a handle created up front with
    /// [`TaskHandle::new_pair`]
    ///
    /// Aborting the handle before the task is first polled prevents it from
    /// running at all.
    fn spawn_registered(&self, future: BoxTask, registration: TaskRegistration) {
        let task = Abortable::new(future, registration.inner);
        self.spawn(Box::pin(async move {
            // An aborted task resolves to Err(Aborted), nothing to report
            let _ = task.await;
        }));
    }
}

/// Registration half of a [`TaskHandle`] pair, consumed by
/// [`Spawner::spawn_registered`]
#[derive(Debug)]
pub struct TaskRegistration {
    inner: AbortRegistration,
}

/// Handle to a task spawned with [`Spawner::spawn_abortable`]
///
/// Dropping the handle does not cancel the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    inner: AbortHandle,
}

impl TaskHandle {
    /// Create a handle before spawning the task it controls
    ///
    /// Useful when two tasks must be able to cancel each other from their
    /// first poll onwards.
    pub fn new_pair() -> (Self, TaskRegistration) {
        let (inner, registration) = AbortHandle::new_pair();
        (
            Self { inner },
            TaskRegistration {
                inner: registration,
            },
        )
    }

    /// Request cancellation of the task
    ///
    /// Safe to call any number of times, and after the task has finished.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Whether [`TaskHandle::abort`] has been called
    pub fn is_aborted(&self) -> bool {
        self.inner.is_aborted()
    }
}

#[cfg(feature = "tokio")]
pub mod tokio;

#[cfg(feature = "smol")]
pub mod smol;

pub mod runtime_utils;

/// Prelude for common imports
pub mod prelude {
    pub use crate::runtime_utils::sleep;
    pub use crate::{BoxTask, Spawner, TaskHandle, TaskRegistration};

    #[cfg(feature = "tokio")]
    pub use crate::tokio::TokioSpawner;

    #[cfg(feature = "smol")]
    pub use crate::smol::SmolSpawner;
}

#[cfg(all(test, feature = "smol"))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_aborted_task_stops_running() {
        ::smol::block_on(async {
            let spawner = crate::smol::SmolSpawner;
            let ticks = Arc::new(AtomicUsize::new(0));
            let counter = ticks.clone();

            let handle = spawner.spawn_abortable(Box::pin(async move {
                for _ in 0..u32::MAX {
                    counter.fetch_add(1, Ordering::SeqCst);
                    runtime_utils::sleep(Duration::from_millis(5)).await;
                }
            }));

            runtime_utils::sleep(Duration::from_millis(30)).await;
            handle.abort();
            assert!(handle.is_aborted());

            // Let any in-flight poll settle before sampling
            runtime_utils::sleep(Duration::from_millis(20)).await;
            let after_abort = ticks.load(Ordering::SeqCst);
            runtime_utils::sleep(Duration::from_millis(40)).await;
            assert_eq!(ticks.load(Ordering::SeqCst), after_abort);
            assert!(after_abort > 0);
        });
    }

    #[test]
    fn test_abort_after_completion_is_harmless() {
        ::smol::block_on(async {
            let spawner = crate::smol::SmolSpawner;
            let (tx, rx) = async_channel::bounded(1);

            let handle = spawner.spawn_abortable(Box::pin(async move {
                tx.send(7u8).await.unwrap();
            }));

            assert_eq!(rx.recv().await.unwrap(), 7);
            handle.abort();
            handle.abort();
            assert!(handle.is_aborted());
        });
    }

    #[test]
    fn test_handle_aborted_before_spawn_never_runs() {
        ::smol::block_on(async {
            let spawner = crate::smol::SmolSpawner;
            let ran = Arc::new(AtomicUsize::new(0));
            let flag = ran.clone();

            let (handle, registration) = TaskHandle::new_pair();
            handle.abort();
            spawner.spawn_registered(
                Box::pin(async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                }),
                registration,
            );

            runtime_utils::sleep(Duration::from_millis(20)).await;
            assert_eq!(ran.load(Ordering::SeqCst), 0);
        });
    }
}
