// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage backend contract and the in-memory implementation

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::FileType;

/// Errors reported by a storage backend
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("object {0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Failed(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Attributes stored alongside every object. They carry enough of the tree
/// (parent key and entry name) to rebuild it when a store is mounted again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub kind: FileType,
    pub parent: Option<String>,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Asynchronous object store reachable only from the storage thread.
///
/// Futures returned by a backend are not required to be `Send`; the engine
/// drives them on a single-threaded runtime.
#[async_trait(?Send)]
pub trait StorageBackend {
    async fn create_node(&self, key: &str, attrs: &ObjectAttributes) -> BackendResult<()>;
    async fn delete_node(&self, key: &str) -> BackendResult<()>;
    async fn read_bytes(&self, key: &str, offset: u64, len: usize) -> BackendResult<Vec<u8>>;
    async fn write_bytes(&self, key: &str, offset: u64, data: &[u8]) -> BackendResult<usize>;
    /// Keys of the objects whose parent is `key`.
    async fn list_children(&self, key: &str) -> BackendResult<Vec<String>>;
    async fn get_attributes(&self, key: &str) -> BackendResult<ObjectAttributes>;
    /// Replace the stored attributes. A size change resizes the content.
    async fn set_attributes(&self, key: &str, attrs: &ObjectAttributes) -> BackendResult<()>;
    async fn read_link_target(&self, key: &str) -> BackendResult<String>;
    async fn create_link(&self, key: &str, target: &str, attrs: &ObjectAttributes)
        -> BackendResult<()>;
}

#[derive(Clone, Debug)]
struct StoredObject {
    attrs: ObjectAttributes,
    content: Vec<u8>,
    link_target: Option<String>,
}

/// Object map shared by every [`MemoryBackend`] built over it, so that a tree
/// outlives the storage thread that wrote it.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects().contains_key(key)
    }

    /// Committed content of an object.
    pub fn content(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).map(|o| o.content.clone())
    }
}

/// In-memory storage backend
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    store: MemoryStore,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn insert(&self, key: &str, object: StoredObject) -> BackendResult<()> {
        let mut objects = self.store.objects();
        if objects.contains_key(key) {
            return Err(BackendError::AlreadyExists(key.to_string()));
        }
        objects.insert(key.to_string(), object);
        Ok(())
    }
}

#[async_trait(?Send)]
impl StorageBackend for MemoryBackend {
    async fn create_node(&self, key: &str, attrs: &ObjectAttributes) -> BackendResult<()> {
        self.insert(
            key,
            StoredObject {
                attrs: attrs.clone(),
                content: vec![0; attrs.size as usize],
                link_target: None,
            },
        )
    }

    async fn delete_node(&self, key: &str) -> BackendResult<()> {
        self.store
            .objects()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn read_bytes(&self, key: &str, offset: u64, len: usize) -> BackendResult<Vec<u8>> {
        let objects = self.store.objects();
        let object = objects.get(key).ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        let start = offset as usize;
        if start >= object.content.len() {
            return Ok(Vec::new());
        }
        let end = std::cmp::min(start.saturating_add(len), object.content.len());
        Ok(object.content[start..end].to_vec())
    }

    async fn write_bytes(&self, key: &str, offset: u64, data: &[u8]) -> BackendResult<usize> {
        let mut objects = self.store.objects();
        let object = objects.get_mut(key).ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > object.content.len() {
            object.content.resize(end, 0);
        }
        object.content[start..end].copy_from_slice(data);
        object.attrs.size = object.content.len() as u64;
        Ok(data.len())
    }

    async fn list_children(&self, key: &str) -> BackendResult<Vec<String>> {
        let objects = self.store.objects();
        if !objects.contains_key(key) {
            return Err(BackendError::NotFound(key.to_string()));
        }
        let mut children: Vec<String> = objects
            .iter()
            .filter(|(_, o)| o.attrs.parent.as_deref() == Some(key))
            .map(|(k, _)| k.clone())
            .collect();
        children.sort();
        Ok(children)
    }

    async fn get_attributes(&self, key: &str) -> BackendResult<ObjectAttributes> {
        self.store
            .objects()
            .get(key)
            .map(|o| o.attrs.clone())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn set_attributes(&self, key: &str, attrs: &ObjectAttributes) -> BackendResult<()> {
        let mut objects = self.store.objects();
        let object = objects.get_mut(key).ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        if attrs.kind == FileType::RegularFile {
            object.content.resize(attrs.size as usize, 0);
        }
        object.attrs = attrs.clone();
        Ok(())
    }

    async fn read_link_target(&self, key: &str) -> BackendResult<String> {
        let objects = self.store.objects();
        let object = objects.get(key).ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        object
            .link_target
            .clone()
            .ok_or_else(|| BackendError::Failed(format!("object {key} is not a link")))
    }

    async fn create_link(
        &self,
        key: &str,
        target: &str,
        attrs: &ObjectAttributes,
    ) -> BackendResult<()> {
        self.insert(
            key,
            StoredObject {
                attrs: attrs.clone(),
                content: Vec::new(),
                link_target: Some(target.to_string()),
            },
        )
    }
}
