//! The repo writer: one OS thread applying every repository mutation of a
//! store in submission order.
//!
//! Callers hand over closures. Results travel back either through a
//! [`MutationHandle`] (awaitable, or waited on from sync code) or, for
//! callers that are already off the async runtime, through a blocking
//! request/response channel.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::mpsc;
use std::task::{Context, Poll};
use std::thread;

use tokio::sync::{mpsc as queue, oneshot};
use tracing::{debug, error};

use crate::cache::error::{StoreError, StoreResult};
use crate::storage::CommitId;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the writer thread. Cloning shares the same queue.
///
/// The thread exits once every handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct RepoWriter {
    tx: queue::UnboundedSender<Job>,
}

impl RepoWriter {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, mut rx) = queue::unbounded_channel::<Job>();
        let thread_name = name.to_string();

        thread::Builder::new().name(thread_name.clone()).spawn(move || {
            debug!(target: "gitkv::cache", "{} started", thread_name);
            while let Some(job) = rx.blocking_recv() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(target: "gitkv::cache", "{}: job panicked", thread_name);
                }
            }
            debug!(target: "gitkv::cache", "{} stopped", thread_name);
        })?;

        Ok(Self { tx })
    }

    /// queue a job; fire and forget
    pub fn submit<F>(&self, job: F) -> StoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(job)).map_err(|_| StoreError::WriterClosed)
    }

    /// queue a job and get a handle on its result
    pub fn run<F, T>(&self, job: F) -> StoreResult<MutationHandle<T>>
    where
        F: FnOnce() -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            // the caller may have stopped waiting
            let _ = tx.send(job());
        })?;
        Ok(MutationHandle { rx })
    }

    /// queue a job and block the calling thread until it has run
    ///
    /// Must not be called from the writer thread itself.
    pub fn run_blocking<F, T>(&self, job: F) -> StoreResult<T>
    where
        F: FnOnce() -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.submit(move || {
            let _ = tx.send(job());
        })?;
        rx.recv().map_err(|_| StoreError::WriterClosed)?
    }
}

impl std::fmt::Debug for RepoWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoWriter").field("closed", &self.tx.is_closed()).finish()
    }
}

/// Completion of a queued operation.
///
/// Resolves once the writer has applied the operation and republished the
/// cache. Dropping the handle does not cancel the operation.
#[derive(Debug)]
pub struct MutationHandle<T = CommitId> {
    rx: oneshot::Receiver<StoreResult<T>>,
}

impl<T> MutationHandle<T> {
    /// wait from synchronous code
    ///
    /// Panics if called from within an async runtime; `.await` the handle
    /// there instead.
    pub fn wait(self) -> StoreResult<T> {
        self.rx.blocking_recv().map_err(|_| StoreError::WriterClosed)?
    }
}

impl<T> Future for MutationHandle<T> {
    type Output = StoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(StoreError::WriterClosed),
        })
    }
}
