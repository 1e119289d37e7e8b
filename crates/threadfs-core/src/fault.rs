// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + a backend decorator that applies it

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::{BackendError, BackendResult, ObjectAttributes, StorageBackend};

/// Backend operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Create,
    Delete,
    Read,
    Write,
    List,
    GetAttributes,
    SetAttributes,
    ReadLink,
    CreateLink,
}

/// Kind of synthetic failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enospc,
}

impl FaultErrno {
    fn to_error(self, op: FaultOp) -> BackendError {
        match self {
            FaultErrno::Eio => BackendError::Failed(format!("injected I/O error on {op:?}")),
            FaultErrno::Enospc => BackendError::Failed(format!("injected out of space on {op:?}")),
        }
    }
}

/// Individual rule describing which op should fail and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Number of leading invocations to let through before failing.
    #[serde(default)]
    pub start_after: u64,
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl Default for FaultRule {
    fn default() -> Self {
        Self {
            op: FaultOp::Write,
            errno: FaultErrno::Eio,
            start_after: 0,
            max_faults: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts. Shared between the
/// test (or operator) and the storage thread.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> FaultPolicy {
        self.state().policy.clone()
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state();
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Total faults injected so far under the current policy.
    pub fn hits(&self) -> u64 {
        self.state().counters.iter().map(|c| c.hits).sum()
    }

    pub fn should_fault(&self, op: FaultOp) -> Option<BackendError> {
        let mut guard = self.state();
        if !guard.policy.enabled {
            return None;
        }
        let FaultState { policy, counters } = &mut *guard;
        counters.resize(policy.rules.len(), RuleCounters::default());
        for (rule, counters) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if rule.max_faults.is_some_and(|max| counters.hits >= max) {
                continue;
            }
            counters.hits = counters.hits.saturating_add(1);
            tracing::debug!(?op, errno = ?rule.errno, "injecting backend fault");
            return Some(rule.errno.to_error(op));
        }
        None
    }
}

/// Backend decorator that consults a [`FaultInjector`] before delegating.
pub struct FaultyBackend<B> {
    inner: B,
    injector: Arc<FaultInjector>,
}

impl<B> FaultyBackend<B> {
    pub fn new(inner: B, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }

    fn check(&self, op: FaultOp) -> BackendResult<()> {
        match self.injector.should_fault(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait(?Send)]
impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    async fn create_node(&self, key: &str, attrs: &ObjectAttributes) -> BackendResult<()> {
        self.check(FaultOp::Create)?;
        self.inner.create_node(key, attrs).await
    }

    async fn delete_node(&self, key: &str) -> BackendResult<()> {
        self.check(FaultOp::Delete)?;
        self.inner.delete_node(key).await
    }

    async fn read_bytes(&self, key: &str, offset: u64, len: usize) -> BackendResult<Vec<u8>> {
        self.check(FaultOp::Read)?;
        self.inner.read_bytes(key, offset, len).await
    }

    async fn write_bytes(&self, key: &str, offset: u64, data: &[u8]) -> BackendResult<usize> {
        self.check(FaultOp::Write)?;
        self.inner.write_bytes(key, offset, data).await
    }

    async fn list_children(&self, key: &str) -> BackendResult<Vec<String>> {
        self.check(FaultOp::List)?;
        self.inner.list_children(key).await
    }

    async fn get_attributes(&self, key: &str) -> BackendResult<ObjectAttributes> {
        self.check(FaultOp::GetAttributes)?;
        self.inner.get_attributes(key).await
    }

    async fn set_attributes(&self, key: &str, attrs: &ObjectAttributes) -> BackendResult<()> {
        self.check(FaultOp::SetAttributes)?;
        self.inner.set_attributes(key, attrs).await
    }

    async fn read_link_target(&self, key: &str) -> BackendResult<String> {
        self.check(FaultOp::ReadLink)?;
        self.inner.read_link_target(key).await
    }

    async fn create_link(
        &self,
        key: &str,
        target: &str,
        attrs: &ObjectAttributes,
    ) -> BackendResult<()> {
        self.check(FaultOp::CreateLink)?;
        self.inner.create_link(key, target, attrs).await
    }
}
