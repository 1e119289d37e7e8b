// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for threadfs

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a node in the tree. Allocated monotonically and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The root directory always carries this id.
    pub const ROOT: NodeId = NodeId(1);

    /// Key under which the node is stored in the backend.
    pub fn storage_key(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        u64::from_str_radix(key, 16).ok().map(NodeId)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque handle identifier for an open file description
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    /// Handles 0..=2 are left to stdio.
    pub const FIRST: u64 = 3;

    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// The three node kinds the tree knows about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

/// File timestamps, in seconds since the epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTimes {
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileTimes {
    pub fn all(at: i64) -> Self {
        Self {
            atime: at,
            mtime: at,
            ctime: at,
        }
    }
}

pub fn current_timestamp() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// File attributes as reported by stat
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub id: NodeId,
    pub file_type: FileType,
    /// Permission bits only (`0o7777`); the file type lives in `file_type`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub times: FileTimes,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// Attribute delta applied by `NodeTable::set_attributes`. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Space taken by the tree, as reported by `statfs`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub nodes: u64,
    pub bytes: u64,
}

/// Permission bits requested from a node, `rwx` order as in the mode word.
pub mod access {
    pub const READ: u32 = 0o4;
    pub const WRITE: u32 = 0o2;
    pub const EXEC: u32 = 0o1;
}

/// Security identity of the (single) effective user
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Check `want` (a combination of [`access`] bits) against a mode word
    pub fn permits(&self, mode: u32, owner_uid: u32, owner_gid: u32, want: u32) -> bool {
        if self.is_root() {
            return true;
        }
        let class = if self.uid == owner_uid {
            (mode >> 6) & 0o7
        } else if self.gid == owner_gid {
            (mode >> 3) & 0o7
        } else {
            mode & 0o7
        };
        class & want == want
    }
}

/// File open options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
    pub directory: bool,
    pub nofollow: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub id: NodeId,
    pub file_type: FileType,
}

/// Origin for `Engine::seek`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}
