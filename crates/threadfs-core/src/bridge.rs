// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Synchronous calls into the storage thread.
//!
//! A [`Bridge`] starts the storage thread, which runs a single-threaded tokio
//! runtime and owns the [`Engine`]. Any thread may then [`Bridge::invoke`] an
//! operation: off the storage thread the call is queued and the caller blocks
//! on a one-shot channel until the result comes back; on the storage thread
//! itself the call runs inline, since queueing it would wait on the thread
//! that is doing the waiting.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use futures::future::LocalBoxFuture;
use tokio::task::LocalSet;
use tracing::{error, info, warn};

use crate::config::FsConfig;
use crate::engine::Engine;
use crate::error::{FsError, FsResult};
use crate::queue::{self, CallStats, OperationQueue, PendingCall, StatsSnapshot};
use crate::storage::StorageBackend;

thread_local! {
    /// Engines owned by the current thread, by bridge id.
    static OWNED: RefCell<HashMap<u64, Rc<RefCell<Engine>>>> = RefCell::new(HashMap::new());
}

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

type StartHook = Box<dyn FnOnce(&Bridge) + Send>;

struct BridgeInner {
    id: u64,
    queue: OperationQueue,
    stats: Arc<CallStats>,
    owner: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeInner {
    fn on_owner_thread(&self) -> bool {
        OWNED
            .try_with(|owned| owned.try_borrow().is_ok_and(|owned| owned.contains_key(&self.id)))
            .unwrap_or(false)
    }

    fn take_owner(&self) -> Option<JoinHandle<()>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn stop(&self) -> FsResult<()> {
        self.queue.shutdown();
        if self.on_owner_thread() {
            return Ok(());
        }
        match self.take_owner() {
            Some(handle) => handle.join().map_err(|_| {
                error!(target: "threadfs::bridge", bridge = self.id, "storage thread panicked");
                FsError::BackendFailure("storage thread panicked".to_string())
            }),
            None => Ok(()),
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        // Errors were already logged by `stop`.
        let _ = self.stop();
    }
}

/// Handle to a running storage thread. Clones share the thread; it stops
/// when [`Bridge::shutdown`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("id", &self.inner.id).finish()
    }
}

pub struct BridgeBuilder {
    config: FsConfig,
    on_start: Option<StartHook>,
}

impl BridgeBuilder {
    /// Run `hook` on the storage thread after mounting, before any queued
    /// call is served. Filesystem calls made by the hook run inline.
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Bridge) + Send + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Start the storage thread and mount the backend built by `backend`
    /// on it. Returns once the mount has finished, with its error if any.
    pub fn spawn<B, F>(self, backend: F) -> FsResult<Bridge>
    where
        B: StorageBackend + 'static,
        F: FnOnce() -> B + Send + 'static,
    {
        let BridgeBuilder { config, on_start } = self;
        let id = NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(CallStats::default());
        let (queue, rx) = OperationQueue::channel(Arc::clone(&stats));
        let bridge = Bridge {
            inner: Arc::new(BridgeInner {
                id,
                queue,
                stats,
                owner: Mutex::new(None),
            }),
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel::<FsResult<()>>(1);
        let owner_bridge = bridge.clone();
        let thread_name = config.storage_thread_name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                // Until the engine is registered this thread cannot tell it
                // owns the bridge, so its clone must go before the spawner
                // can drop the last one.
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        drop(owner_bridge);
                        let _ = ready_tx.send(Err(FsError::BackendFailure(format!(
                            "failed to start storage runtime: {err}"
                        ))));
                        return;
                    }
                };
                let local = LocalSet::new();
                let mounted = local.block_on(&runtime, Engine::mount(config, Box::new(backend())));
                let engine = match mounted {
                    Ok(engine) => Rc::new(RefCell::new(engine)),
                    Err(err) => {
                        drop(owner_bridge);
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                OWNED.with(|owned| owned.borrow_mut().insert(id, Rc::clone(&engine)));
                let _ = ready_tx.send(Ok(()));

                if let Some(hook) = on_start {
                    hook(&owner_bridge);
                }
                drop(owner_bridge);

                local.block_on(&runtime, queue::serve(rx, Rc::clone(&engine)));
                OWNED.with(|owned| owned.borrow_mut().remove(&id));
                info!(target: "threadfs::bridge", bridge = id, "storage thread stopped");
            })
            .map_err(|err| {
                FsError::BackendFailure(format!("failed to spawn storage thread: {err}"))
            })?;
        *bridge.inner.owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(target: "threadfs::bridge", bridge = id, thread = %thread_name, "storage thread ready");
                Ok(bridge)
            }
            Ok(Err(err)) => {
                warn!(target: "threadfs::bridge", bridge = id, %err, "mount failed");
                Err(err)
            }
            Err(_) => {
                if let Some(handle) = bridge.inner.take_owner() {
                    let _ = handle.join();
                }
                Err(FsError::BackendFailure("storage thread exited during mount".to_string()))
            }
        }
    }
}

impl Bridge {
    pub fn builder(config: FsConfig) -> BridgeBuilder {
        BridgeBuilder {
            config,
            on_start: None,
        }
    }

    pub fn spawn<B, F>(config: FsConfig, backend: F) -> FsResult<Bridge>
    where
        B: StorageBackend + 'static,
        F: FnOnce() -> B + Send + 'static,
    {
        Self::builder(config).spawn(backend)
    }

    /// Process-unique id of this bridge.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_storage_thread(&self) -> bool {
        self.inner.on_owner_thread()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Run `op` against the engine and return its result, blocking the
    /// calling thread until it is available.
    ///
    /// On the storage thread the operation runs inline. If the engine is
    /// already busy there (an operation is calling back into the bridge), the
    /// call fails with [`FsError::BackendFailure`] rather than deadlocking.
    pub fn invoke<T, F>(&self, name: &'static str, op: F) -> FsResult<T>
    where
        T: Send + 'static,
        F: for<'e> FnOnce(&'e mut Engine) -> LocalBoxFuture<'e, FsResult<T>> + Send + 'static,
    {
        if let Some(engine) = self.owned_engine() {
            return self.run_inline(name, &engine, op);
        }
        self.inner.queue.submit(name, op)?.wait()
    }

    /// Queue `op` and return the pending call, for callers running on an
    /// async runtime of their own.
    pub fn call_async<T, F>(&self, name: &'static str, op: F) -> FsResult<PendingCall<T>>
    where
        T: Send + 'static,
        F: for<'e> FnOnce(&'e mut Engine) -> LocalBoxFuture<'e, FsResult<T>> + Send + 'static,
    {
        self.inner.queue.submit(name, op)
    }

    /// Run `task` on the storage thread between two operations. Calls the
    /// task makes through a bridge take the inline path.
    pub fn post<F>(&self, task: F) -> FsResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.post(Box::new(task))
    }

    /// Stop the storage thread after everything queued so far, committing
    /// pending writes, and wait for it to exit. Calls submitted afterwards fail.
    pub fn shutdown(&self) -> FsResult<()> {
        self.inner.stop()
    }

    fn owned_engine(&self) -> Option<Rc<RefCell<Engine>>> {
        OWNED
            .try_with(|owned| owned.try_borrow().ok().and_then(|o| o.get(&self.inner.id).cloned()))
            .ok()
            .flatten()
    }

    fn run_inline<T, F>(&self, name: &'static str, engine: &RefCell<Engine>, op: F) -> FsResult<T>
    where
        F: for<'e> FnOnce(&'e mut Engine) -> LocalBoxFuture<'e, FsResult<T>>,
    {
        self.inner.stats.record_inline();
        let result = match engine.try_borrow_mut() {
            Ok(mut guard) => futures::executor::block_on(op(&mut *guard)),
            Err(_) => {
                warn!(target: "threadfs::bridge", name, "re-entrant call on the storage thread");
                Err(FsError::BackendFailure("re-entrant call on the storage thread".to_string()))
            }
        };
        self.inner.stats.record_result(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::storage::MemoryBackend;
    use crate::types::NodeId;

    fn bridge() -> Bridge {
        Bridge::spawn(FsConfig::default(), MemoryBackend::new).expect("spawn")
    }

    #[test]
    fn invoke_from_another_thread_is_queued() {
        let bridge = bridge();
        bridge
            .invoke("mkdir", |engine| engine.mkdir("/q", NodeId::ROOT, 0o755).boxed_local())
            .unwrap();
        let attrs = bridge
            .invoke("stat", |engine| engine.stat("/q", NodeId::ROOT).boxed_local())
            .unwrap();
        assert!(attrs.is_dir());
        let stats = bridge.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.inline, 0);
        assert!(!bridge.is_storage_thread());
    }

    #[test]
    fn errors_cross_the_bridge_unchanged() {
        let bridge = bridge();
        let err = bridge
            .invoke("rmdir", |engine| engine.rmdir("/nope", NodeId::ROOT).boxed_local())
            .unwrap_err();
        assert_eq!(err, FsError::NotFound);
        assert_eq!(bridge.stats().failed, 1);
    }

    #[test]
    fn on_start_hook_runs_inline() {
        let (tx, rx) = mpsc::channel();
        let bridge = Bridge::builder(FsConfig::default())
            .on_start(move |bridge| {
                let result = bridge
                    .invoke("stat", |engine| engine.stat("/", NodeId::ROOT).boxed_local())
                    .map(|attrs| attrs.is_dir());
                tx.send((result, bridge.is_storage_thread())).unwrap();
            })
            .spawn(MemoryBackend::new)
            .unwrap();
        assert_eq!(rx.recv().unwrap(), (Ok(true), true));
        assert_eq!(bridge.stats().inline, 1);
    }

    #[test]
    fn reentrant_inline_call_fails_instead_of_deadlocking() {
        let bridge = bridge();
        let inner = bridge.clone();
        let result = bridge
            .invoke("outer", move |_engine| {
                async move {
                    let nested = inner
                        .invoke("inner", |engine| engine.stat("/", NodeId::ROOT).boxed_local());
                    Ok(nested.map(|_| ()))
                }
                .boxed_local()
            })
            .unwrap();
        assert!(matches!(result, Err(FsError::BackendFailure(_))));
    }

    #[test]
    fn posted_tasks_run_on_the_storage_thread() {
        let bridge = bridge();
        let (tx, rx) = mpsc::channel();
        let inner = bridge.clone();
        bridge
            .post(move || {
                let created = inner
                    .invoke("mkdir", |engine| engine.mkdir("/posted", NodeId::ROOT, 0o755).boxed_local());
                tx.send((created, inner.is_storage_thread())).unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv().unwrap(), (Ok(()), true));
        assert!(bridge
            .invoke("stat", |engine| engine.stat("/posted", NodeId::ROOT).boxed_local())
            .is_ok());
    }

    #[test]
    fn calls_after_shutdown_fail() {
        let bridge = bridge();
        bridge.shutdown().unwrap();
        let err = bridge
            .invoke("stat", |engine| engine.stat("/", NodeId::ROOT).boxed_local())
            .unwrap_err();
        assert!(matches!(err, FsError::BackendFailure(_)));
        bridge.shutdown().unwrap();
    }

    #[test]
    fn mount_errors_are_reported_by_spawn() {
        use crate::fault::{FaultInjector, FaultOp, FaultPolicy, FaultRule, FaultyBackend};

        let injector = Arc::new(FaultInjector::new());
        injector.set_policy(FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                op: FaultOp::Create,
                ..Default::default()
            }],
        });
        let err = Bridge::spawn(FsConfig::default(), move || {
            FaultyBackend::new(MemoryBackend::new(), injector)
        })
        .unwrap_err();
        assert!(matches!(err, FsError::BackendFailure(_)));
    }

    #[tokio::test]
    async fn call_async_can_be_awaited() {
        let bridge = bridge();
        let pending = bridge
            .call_async("mkdir", |engine| engine.mkdir("/async", NodeId::ROOT, 0o700).boxed_local())
            .unwrap();
        assert!(pending.seq() >= 1);
        assert_eq!(pending.name(), "mkdir");
        pending.await.unwrap();
        let attrs = bridge
            .call_async("stat", |engine| engine.stat("/async", NodeId::ROOT).boxed_local())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(attrs.mode, 0o700);
    }
}
