// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Multi-threaded behaviour of the bridge against a shared tree

use std::sync::{Arc, Barrier};
use std::thread;

use futures::FutureExt;
use threadfs_core::{
    Bridge, FaultInjector, FaultOp, FaultPolicy, FaultRule, FaultyBackend, FsConfig, FsError,
    MemoryBackend, MemoryStore, NodeId, OpenFlags,
};

const ROOT: NodeId = NodeId::ROOT;

fn spawn_over(store: &MemoryStore) -> Bridge {
    let store = store.clone();
    Bridge::spawn(FsConfig::default(), move || MemoryBackend::with_store(store)).expect("spawn")
}

fn rw_create() -> OpenFlags {
    OpenFlags {
        read: true,
        write: true,
        create: true,
        ..Default::default()
    }
}

#[test]
fn concurrent_mkdir_has_exactly_one_winner() {
    let bridge = spawn_over(&MemoryStore::new());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let bridge = bridge.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                bridge.invoke("mkdir", |engine| engine.mkdir("/race", ROOT, 0o755).boxed_local())
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter(|r| r.is_err()).all(|r| *r == Err(FsError::AlreadyExists)));
    assert_eq!(bridge.stats().submitted, threads as u64);
}

#[test]
fn data_written_on_one_thread_is_read_on_another() {
    let bridge = spawn_over(&MemoryStore::new());

    let writer = bridge.clone();
    thread::spawn(move || {
        let fd = writer
            .invoke("open", |engine| engine.open("/shared", ROOT, rw_create(), 0o644).boxed_local())
            .unwrap();
        let written = writer
            .invoke("write", move |engine| engine.write(fd, b"from another thread").boxed_local())
            .unwrap();
        assert_eq!(written, 19);
        // Left open: the reader must see uncommitted bytes.
    })
    .join()
    .unwrap();

    let reader = bridge.clone();
    let data = thread::spawn(move || {
        let fd = reader
            .invoke("open", |engine| {
                engine.open("/shared", ROOT, OpenFlags::read_only(), 0).boxed_local()
            })
            .unwrap();
        reader.invoke("read", move |engine| engine.read(fd, 64).boxed_local()).unwrap()
    })
    .join()
    .unwrap();
    assert_eq!(data, b"from another thread");
}

#[test]
fn tree_survives_a_bridge_restart() {
    let store = MemoryStore::new();
    let first = spawn_over(&store);
    first
        .invoke("mkdir", |engine| engine.mkdir("/kept", ROOT, 0o700).boxed_local())
        .unwrap();
    first
        .invoke("symlink", |engine| engine.symlink("../elsewhere", "/kept/link", ROOT).boxed_local())
        .unwrap();
    let fd = first
        .invoke("open", |engine| engine.open("/kept/data", ROOT, rw_create(), 0o600).boxed_local())
        .unwrap();
    first
        .invoke("write", move |engine| engine.write(fd, b"persisted").boxed_local())
        .unwrap();
    // Shutdown commits the open file.
    first.shutdown().unwrap();

    let second = spawn_over(&store);
    let attrs = second
        .invoke("stat", |engine| engine.stat("/kept", ROOT).boxed_local())
        .unwrap();
    assert!(attrs.is_dir());
    assert_eq!(attrs.mode, 0o700);
    let target = second
        .invoke("readlink", |engine| engine.readlink("/kept/link", ROOT).boxed_local())
        .unwrap();
    assert_eq!(target, "../elsewhere");
    let fd = second
        .invoke("open", |engine| {
            engine.open("/kept/data", ROOT, OpenFlags::read_only(), 0).boxed_local()
        })
        .unwrap();
    let data = second.invoke("read", move |engine| engine.read(fd, 64).boxed_local()).unwrap();
    assert_eq!(data, b"persisted");
}

#[test]
fn panicking_operation_unblocks_callers() {
    let bridge = spawn_over(&MemoryStore::new());
    let result: Result<(), FsError> = bridge.invoke("explode", |_engine| {
        async move {
            let explode = true;
            if explode {
                panic!("operation blew up");
            }
            Ok(())
        }
        .boxed_local()
    });
    assert!(matches!(result, Err(FsError::BackendFailure(_))));

    let later = bridge.invoke("stat", |engine| engine.stat("/", ROOT).boxed_local());
    assert!(matches!(later, Err(FsError::BackendFailure(_))));
    assert!(matches!(bridge.shutdown(), Err(FsError::BackendFailure(_))));
}

#[test]
fn backend_fault_fails_one_call_and_the_tree_stays_usable() {
    let injector = Arc::new(FaultInjector::new());
    let faults = Arc::clone(&injector);
    let bridge = Bridge::spawn(FsConfig::default(), move || {
        FaultyBackend::new(MemoryBackend::new(), faults)
    })
    .expect("spawn");

    injector.set_policy(FaultPolicy {
        enabled: true,
        rules: vec![FaultRule {
            op: FaultOp::Create,
            max_faults: Some(1),
            ..Default::default()
        }],
    });
    let failed = bridge.invoke("mkdir", |engine| engine.mkdir("/flaky", ROOT, 0o755).boxed_local());
    assert!(matches!(failed, Err(FsError::BackendFailure(_))));
    assert_eq!(
        bridge.invoke("stat", |engine| engine.stat("/flaky", ROOT).boxed_local()),
        Err(FsError::NotFound)
    );

    bridge
        .invoke("mkdir", |engine| engine.mkdir("/flaky", ROOT, 0o755).boxed_local())
        .unwrap();
    assert_eq!(injector.hits(), 1);
    assert_eq!(bridge.stats().failed, 2);
}

#[test]
fn calls_are_served_in_submission_order() {
    let bridge = spawn_over(&MemoryStore::new());
    let first = bridge
        .call_async("mkdir", |engine| engine.mkdir("/ordered", ROOT, 0o755).boxed_local())
        .unwrap();
    let second = bridge
        .call_async("rmdir", |engine| engine.rmdir("/ordered", ROOT).boxed_local())
        .unwrap();
    assert!(first.seq() < second.seq());
    assert_eq!(first.wait(), Ok(()));
    assert_eq!(second.wait(), Ok(()));
    assert_eq!(
        bridge.invoke("stat", |engine| engine.stat("/ordered", ROOT).boxed_local()),
        Err(FsError::NotFound)
    );
}
