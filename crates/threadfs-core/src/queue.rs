// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! FIFO of operations bound for the storage thread.
//!
//! Senders live on any thread; the single receiver is drained by [`serve`] on
//! the storage thread. Every operation, including each of its backend awaits,
//! finishes before the next job is taken off the queue.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::engine::Engine;
use crate::error::{FsError, FsResult};

/// Type-erased operation, run once against the engine.
pub(crate) type OpFn = Box<dyn for<'e> FnOnce(&'e mut Engine) -> LocalBoxFuture<'e, ()> + Send>;

/// Closure run on the storage thread between operations.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

pub(crate) enum Job {
    Call {
        seq: u64,
        name: &'static str,
        run: OpFn,
    },
    Task(Task),
    Shutdown,
}

fn erase<F>(f: F) -> OpFn
where
    F: for<'e> FnOnce(&'e mut Engine) -> LocalBoxFuture<'e, ()> + Send + 'static,
{
    Box::new(f)
}

/// Lifecycle of a single call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Resolved,
    Delivered,
}

/// Call counters shared by the queue, the storage thread and the bridge.
#[derive(Debug, Default)]
pub struct CallStats {
    submitted: AtomicU64,
    inline: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Calls that went through the queue
    pub submitted: u64,
    /// Calls executed directly on the storage thread
    pub inline: u64,
    pub completed: u64,
    /// Completed calls that returned an error
    pub failed: u64,
}

impl CallStats {
    pub(crate) fn record_inline(&self) {
        self.inline.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_result<T>(&self, result: &FsResult<T>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            inline: self.inline.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn thread_gone() -> FsError {
    FsError::BackendFailure("storage thread is not running".to_string())
}

/// Sending side of the queue
#[derive(Clone)]
pub(crate) struct OperationQueue {
    tx: mpsc::UnboundedSender<Job>,
    next_seq: Arc<AtomicU64>,
    stats: Arc<CallStats>,
}

impl OperationQueue {
    pub(crate) fn channel(stats: Arc<CallStats>) -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            next_seq: Arc::new(AtomicU64::new(1)),
            stats,
        };
        (queue, rx)
    }

    pub(crate) fn submit<T, F>(&self, name: &'static str, op: F) -> FsResult<PendingCall<T>>
    where
        T: Send + 'static,
        F: for<'e> FnOnce(&'e mut Engine) -> LocalBoxFuture<'e, FsResult<T>> + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let stats = Arc::clone(&self.stats);
        let run = erase(move |engine| {
            async move {
                let result = op(engine).await;
                stats.record_result(&result);
                trace!(target: "threadfs::queue", seq, name, state = ?CallState::Resolved, ok = result.is_ok());
                // The caller may have stopped waiting; the result is dropped then.
                let _ = reply.send(result);
            }
            .boxed_local()
        });
        self.tx.send(Job::Call { seq, name, run }).map_err(|_| thread_gone())?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(target: "threadfs::queue", seq, name, state = ?CallState::Pending);
        Ok(PendingCall { seq, name, rx })
    }

    pub(crate) fn post(&self, task: Task) -> FsResult<()> {
        self.tx.send(Job::Task(task)).map_err(|_| thread_gone())
    }

    /// Ask the storage thread to stop once everything queued so far has run.
    pub(crate) fn shutdown(&self) -> bool {
        self.tx.send(Job::Shutdown).is_ok()
    }
}

/// Result slot of one submitted call. Wait on it synchronously with
/// [`PendingCall::wait`] or `.await` it. Its [`CallState`] transitions are
/// reported as `trace` events under `threadfs::queue`.
#[derive(Debug)]
pub struct PendingCall<T> {
    seq: u64,
    name: &'static str,
    rx: oneshot::Receiver<FsResult<T>>,
}

fn deliver<T>(
    seq: u64,
    name: &'static str,
    received: Result<FsResult<T>, oneshot::error::RecvError>,
) -> FsResult<T> {
    trace!(target: "threadfs::queue", seq, name, state = ?CallState::Delivered, dropped = received.is_err());
    received.unwrap_or_else(|_| Err(thread_gone()))
}

impl<T> PendingCall<T> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the current thread until the storage thread has run the call.
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> FsResult<T> {
        let PendingCall { seq, name, rx } = self;
        deliver(seq, name, rx.blocking_recv())
    }
}

impl<T> Future for PendingCall<T> {
    type Output = FsResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (seq, name) = (self.seq, self.name);
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(received) => Poll::Ready(deliver(seq, name, received)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Drain the queue until a shutdown marker arrives or every sender is gone.
// Inline calls made while an operation holds the engine see the borrow and
// fail instead of waiting on it.
#[allow(clippy::await_holding_refcell_ref)]
pub(crate) async fn serve(mut rx: mpsc::UnboundedReceiver<Job>, engine: Rc<RefCell<Engine>>) {
    let mut served = 0u64;
    while let Some(job) = rx.recv().await {
        match job {
            Job::Call { seq, name, run } => {
                debug!(target: "threadfs::queue", seq, name, "running operation");
                let mut guard = engine.borrow_mut();
                run(&mut *guard).await;
                served += 1;
            }
            Job::Task(task) => task(),
            Job::Shutdown => {
                rx.close();
                let mut abandoned = 0usize;
                while rx.try_recv().is_ok() {
                    abandoned += 1;
                }
                if let Err(err) = engine.borrow_mut().shutdown().await {
                    warn!(target: "threadfs::queue", %err, "flush at shutdown failed");
                }
                info!(target: "threadfs::queue", served, abandoned, "operation queue shut down");
                return;
            }
        }
    }
    if let Err(err) = engine.borrow_mut().shutdown().await {
        warn!(target: "threadfs::queue", %err, "flush at shutdown failed");
    }
    info!(target: "threadfs::queue", served, "operation queue closed");
}
