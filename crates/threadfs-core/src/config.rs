// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for a threadfs instance

use serde::{Deserialize, Serialize};

use crate::types::Credentials;

/// Top-level filesystem configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FsConfig {
    pub security: SecurityPolicy,
    pub limits: FsLimits,
    /// Name given to the thread that owns the storage engine
    pub storage_thread_name: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            security: SecurityPolicy::default(),
            limits: FsLimits::default(),
            storage_thread_name: "threadfs-storage".to_string(),
        }
    }
}

impl FsConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            uid: self.security.uid,
            gid: self.security.gid,
        }
    }
}

/// Identity of the effective user and ownership of a freshly created root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SecurityPolicy {
    pub uid: u32,
    pub gid: u32,
    pub enforce_permissions: bool,
    pub root_uid: u32,
    pub root_gid: u32,
    pub root_mode: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            uid: 1000,
            gid: 1000,
            enforce_permissions: true,
            root_uid: 1000,
            root_gid: 1000,
            root_mode: 0o777,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FsLimits {
    /// Symlink expansions allowed during a single path resolution
    pub max_symlink_hops: u32,
    /// Uncommitted bytes a file may buffer before they are flushed to the backend
    pub write_buffer_bytes: usize,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_symlink_hops: 40,
            write_buffer_bytes: 64 * 1024,
        }
    }
}
