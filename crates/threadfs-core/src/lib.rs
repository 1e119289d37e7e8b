// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core of threadfs: an in-memory directory tree whose contents live in an
//! asynchronous, single-threaded store, driven from one storage thread and
//! callable synchronously from any other thread through a [`Bridge`].

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod node;
pub mod queue;
pub mod resolve;
pub mod storage;
pub mod types;

pub use bridge::{Bridge, BridgeBuilder};
pub use config::{FsConfig, FsLimits, SecurityPolicy};
pub use engine::Engine;
pub use error::{FsError, FsResult};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule, FaultyBackend};
pub use node::{Node, NodeKind, NodeTable};
pub use queue::{CallState, PendingCall, StatsSnapshot};
pub use resolve::Resolver;
pub use storage::{
    BackendError, BackendResult, MemoryBackend, MemoryStore, ObjectAttributes, StorageBackend,
};
pub use types::{
    access, Attributes, Credentials, DirEntry, FileTimes, FileType, HandleId, NodeId, OpenFlags,
    SetAttributes, Usage, Whence,
};
