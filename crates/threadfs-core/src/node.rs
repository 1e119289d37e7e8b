// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory directory tree owned by the storage thread

use std::collections::HashMap;

use crate::error::{FsError, FsResult};
use crate::types::{Attributes, DirEntry, FileTimes, FileType, NodeId, SetAttributes, Usage};

/// Block size reported for directories
pub const DIRECTORY_SIZE: u64 = 4096;

/// Bytes written through a handle but not yet committed to the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingWrite {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl PendingWrite {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Size bookkeeping and write buffer of a regular file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileContent {
    /// Logical size, pending writes included
    pub size: u64,
    /// Size of the bytes the backend holds
    pub committed: u64,
    pub pending: Vec<PendingWrite>,
    pub pending_bytes: usize,
}

impl FileContent {
    pub fn with_size(size: u64) -> Self {
        Self {
            size,
            committed: size,
            ..Default::default()
        }
    }

    /// Buffer a write and grow the logical size to cover it.
    pub fn stage(&mut self, offset: u64, data: &[u8]) {
        let write = PendingWrite {
            offset,
            data: data.to_vec(),
        };
        self.size = self.size.max(write.end());
        self.pending_bytes += data.len();
        self.pending.push(write);
    }

    /// Hand the buffered writes to the caller, oldest first.
    pub fn take_pending(&mut self) -> Vec<PendingWrite> {
        self.pending_bytes = 0;
        self.committed = self.size;
        std::mem::take(&mut self.pending)
    }

    /// Put back the writes of an unfinished commit, ahead of anything staged
    /// since. Writes the backend already took are replayed by the next commit,
    /// so `committed` goes back to its value before the attempt.
    pub fn requeue(&mut self, mut writes: Vec<PendingWrite>, committed: u64) {
        writes.append(&mut self.pending);
        self.pending_bytes = writes.iter().map(|w| w.data.len()).sum();
        self.pending = writes;
        self.committed = committed.min(self.size);
    }

    /// Lay pending writes over `buf`, which holds the bytes at `offset`.
    pub fn overlay(&self, offset: u64, buf: &mut [u8]) {
        let end = offset + buf.len() as u64;
        for write in &self.pending {
            let from = write.offset.max(offset);
            let to = write.end().min(end);
            if from >= to {
                continue;
            }
            let src = &write.data[(from - write.offset) as usize..(to - write.offset) as usize];
            buf[(from - offset) as usize..(to - offset) as usize].copy_from_slice(src);
        }
    }

    fn resize(&mut self, size: u64) {
        if size < self.size {
            self.pending.retain_mut(|write| {
                if write.offset >= size {
                    return false;
                }
                if write.end() > size {
                    write.data.truncate((size - write.offset) as usize);
                }
                true
            });
            self.pending_bytes = self.pending.iter().map(|w| w.data.len()).sum();
        }
        self.size = size;
        self.committed = self.committed.min(size);
    }
}

/// Node kinds
#[derive(Clone, Debug)]
pub enum NodeKind {
    File(FileContent),
    Directory { children: HashMap<String, NodeId> },
    Symlink { target: String },
}

/// Kind of node to create, carrying what is known at creation time
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NewNode {
    File,
    Directory,
    Symlink(String),
}

/// Mode and owner of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ownership {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Filesystem node
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub parent: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub times: FileTimes,
    /// Zero once the node is detached from the tree.
    pub nlink: u32,
}

impl Node {
    pub fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::File(_) => FileType::RegularFile,
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::Symlink { .. } => FileType::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_attached(&self) -> bool {
        self.nlink > 0
    }

    pub fn ownership(&self) -> Ownership {
        Ownership {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
        }
    }

    pub fn children(&self) -> FsResult<&HashMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Ok(children),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn content(&self) -> FsResult<&FileContent> {
        match &self.kind {
            NodeKind::File(content) => Ok(content),
            NodeKind::Directory { .. } => Err(FsError::IsADirectory),
            NodeKind::Symlink { .. } => Err(FsError::InvalidArgument),
        }
    }

    pub fn content_mut(&mut self) -> FsResult<&mut FileContent> {
        match &mut self.kind {
            NodeKind::File(content) => Ok(content),
            NodeKind::Directory { .. } => Err(FsError::IsADirectory),
            NodeKind::Symlink { .. } => Err(FsError::InvalidArgument),
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(content) => content.size,
            NodeKind::Directory { .. } => DIRECTORY_SIZE,
            NodeKind::Symlink { target } => target.len() as u64,
        }
    }
}

/// The directory tree. Every mutation runs on the storage thread, so the
/// table carries no locks.
#[derive(Debug)]
pub struct NodeTable {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
}

impl NodeTable {
    pub fn with_root(owner: Ownership, now: i64) -> Self {
        let root = Node {
            id: NodeId::ROOT,
            parent: NodeId::ROOT,
            name: String::new(),
            kind: NodeKind::Directory {
                children: HashMap::new(),
            },
            mode: owner.mode & 0o7777,
            uid: owner.uid,
            gid: owner.gid,
            times: FileTimes::all(now),
            nlink: 2,
        };
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, root);
        Self {
            nodes,
            next_id: NodeId::ROOT.0 + 1,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn lookup_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    fn get(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or(FsError::NotFound)
    }

    fn get_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(FsError::NotFound)
    }

    /// Child of `parent` called `name`.
    pub fn child(&self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        self.get(parent)?.children()?.get(name).copied().ok_or(FsError::NotFound)
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn validate_name(name: &str) -> FsResult<()> {
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    /// Look up `parent` as a live directory that may receive new entries.
    fn attached_dir(&self, parent: NodeId) -> FsResult<&HashMap<String, NodeId>> {
        let node = self.get(parent)?;
        let children = node.children()?;
        if !node.is_attached() {
            return Err(FsError::NotFound);
        }
        Ok(children)
    }

    pub fn create_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NewNode,
        owner: Ownership,
        now: i64,
    ) -> FsResult<NodeId> {
        if name == "." || name == ".." {
            return Err(FsError::AlreadyExists);
        }
        Self::validate_name(name)?;
        if self.attached_dir(parent)?.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }

        let id = self.allocate_id();
        let (kind, nlink) = match kind {
            NewNode::File => (NodeKind::File(FileContent::default()), 1),
            NewNode::Directory => (
                NodeKind::Directory {
                    children: HashMap::new(),
                },
                2,
            ),
            NewNode::Symlink(target) => (NodeKind::Symlink { target }, 1),
        };
        let node = Node {
            id,
            parent,
            name: name.to_string(),
            kind,
            mode: owner.mode & 0o7777,
            uid: owner.uid,
            gid: owner.gid,
            times: FileTimes::all(now),
            nlink,
        };
        let is_dir = node.is_dir();
        self.nodes.insert(id, node);
        self.link(parent, name, id, is_dir, now);
        Ok(id)
    }

    fn link(&mut self, parent: NodeId, name: &str, child: NodeId, is_dir: bool, now: i64) {
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            if let NodeKind::Directory { children } = &mut parent_node.kind {
                children.insert(name.to_string(), child);
                parent_node.times.mtime = now;
                parent_node.times.ctime = now;
                if is_dir {
                    parent_node.nlink = parent_node.nlink.saturating_add(1);
                }
            }
        }
    }

    fn unlink(&mut self, parent: NodeId, name: &str, now: i64) -> Option<NodeId> {
        let child = {
            let parent_node = self.nodes.get_mut(&parent)?;
            let NodeKind::Directory { children } = &mut parent_node.kind else {
                return None;
            };
            let child = children.remove(name)?;
            parent_node.times.mtime = now;
            parent_node.times.ctime = now;
            child
        };
        if self.nodes.get(&child).is_some_and(Node::is_dir) {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.nlink = parent_node.nlink.saturating_sub(1);
            }
        }
        Some(child)
    }

    /// Mark `root` and everything below it as detached, returning the ids,
    /// `root` first.
    fn detach_subtree(&mut self, root: NodeId) -> Vec<NodeId> {
        let mut detached = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            node.nlink = 0;
            if let NodeKind::Directory { children } = &node.kind {
                stack.extend(children.values().copied());
            }
            detached.push(id);
        }
        detached
    }

    /// Detach `name` from `parent`. The removed nodes stay in the table with a
    /// link count of zero until [`NodeTable::forget`] drops them.
    pub fn remove_child(
        &mut self,
        parent: NodeId,
        name: &str,
        recursive: bool,
        now: i64,
    ) -> FsResult<Vec<NodeId>> {
        match name {
            "." => return Err(FsError::InvalidArgument),
            ".." => return Err(FsError::NotEmpty),
            _ => {}
        }
        let child = self.child(parent, name)?;
        if let NodeKind::Directory { children } = &self.get(child)?.kind {
            if !recursive && !children.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }
        self.unlink(parent, name, now);
        Ok(self.detach_subtree(child))
    }

    /// Move an entry, replacing whatever `dst_name` named before. Every check
    /// happens before the tree is touched, so the move either fully happens or
    /// leaves the tree unchanged. Returns the replaced node, now detached.
    pub fn move_child(
        &mut self,
        src_parent: NodeId,
        src_name: &str,
        dst_parent: NodeId,
        dst_name: &str,
        now: i64,
    ) -> FsResult<Option<NodeId>> {
        if matches!(src_name, "." | "..") || matches!(dst_name, "." | "..") {
            return Err(FsError::InvalidArgument);
        }
        Self::validate_name(dst_name)?;
        let src = self.child(src_parent, src_name)?;
        let existing = self.attached_dir(dst_parent)?.get(dst_name).copied();
        if existing == Some(src) {
            return Ok(None);
        }

        let src_is_dir = self.get(src)?.is_dir();
        if src_is_dir && self.is_ancestor(src, dst_parent) {
            return Err(FsError::InvalidArgument);
        }
        if let Some(existing) = existing {
            let target = self.get(existing)?;
            match (&target.kind, src_is_dir) {
                (NodeKind::Directory { children }, true) => {
                    if !children.is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                }
                (NodeKind::Directory { .. }, false) => return Err(FsError::IsADirectory),
                (_, true) => return Err(FsError::NotADirectory),
                (_, false) => {}
            }
        }

        if let Some(existing) = existing {
            self.unlink(dst_parent, dst_name, now);
            self.detach_subtree(existing);
        }
        self.unlink(src_parent, src_name, now);
        if let Some(node) = self.nodes.get_mut(&src) {
            node.parent = dst_parent;
            node.name = dst_name.to_string();
            node.times.ctime = now;
        }
        self.link(dst_parent, dst_name, src, src_is_dir, now);
        Ok(existing)
    }

    /// Whether `node` is `ancestor` or lies below it.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = node;
        loop {
            if current == ancestor {
                return true;
            }
            match self.nodes.get(&current) {
                Some(n) if n.parent != current => current = n.parent,
                _ => return false,
            }
        }
    }

    pub fn get_attributes(&self, id: NodeId) -> FsResult<Attributes> {
        let node = self.get(id)?;
        Ok(Attributes {
            id,
            file_type: node.file_type(),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            size: node.size(),
            nlink: node.nlink,
            times: node.times,
        })
    }

    pub fn set_attributes(&mut self, id: NodeId, attrs: &SetAttributes, now: i64) -> FsResult<()> {
        let node = self.get_mut(id)?;
        if let Some(size) = attrs.size {
            let content = node.content_mut()?;
            if size != content.size {
                content.resize(size);
                node.times.mtime = now;
            }
        }
        if let Some(mode) = attrs.mode {
            node.mode = mode & 0o7777;
        }
        if let Some(uid) = attrs.uid {
            node.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            node.gid = gid;
        }
        if let Some(atime) = attrs.atime {
            node.times.atime = atime;
        }
        if let Some(mtime) = attrs.mtime {
            node.times.mtime = mtime;
        }
        node.times.ctime = now;
        Ok(())
    }

    pub fn usage(&self) -> Usage {
        let bytes = self
            .nodes
            .values()
            .filter_map(|n| match &n.kind {
                NodeKind::File(content) => Some(content.size),
                _ => None,
            })
            .sum();
        Usage {
            nodes: self.nodes.len() as u64,
            bytes,
        }
    }

    /// Files holding writes that have not reached the backend yet.
    pub fn dirty_files(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| matches!(&n.kind, NodeKind::File(c) if !c.pending.is_empty()))
            .map(|n| n.id)
            .collect();
        ids.sort();
        ids
    }

    /// Drop a detached node for good.
    pub fn forget(&mut self, id: NodeId) -> Option<Node> {
        match self.nodes.get(&id) {
            Some(node) if !node.is_attached() && id != NodeId::ROOT => self.nodes.remove(&id),
            _ => None,
        }
    }

    /// Absolute path of an attached node.
    pub fn path_of(&self, id: NodeId) -> FsResult<String> {
        let mut names = Vec::new();
        let mut current = self.get(id)?;
        while current.id != NodeId::ROOT {
            if !current.is_attached() {
                return Err(FsError::NotFound);
            }
            names.push(current.name.as_str());
            current = self.get(current.parent)?;
        }
        if names.is_empty() {
            return Ok("/".to_string());
        }
        names.reverse();
        Ok(names.iter().fold(String::new(), |mut acc, name| {
            acc.push('/');
            acc.push_str(name);
            acc
        }))
    }

    /// Entries of a directory sorted by name, without `.` and `..`.
    pub fn read_dir(&self, id: NodeId) -> FsResult<Vec<DirEntry>> {
        let children = self.get(id)?.children()?;
        let mut entries: Vec<DirEntry> = children
            .iter()
            .filter_map(|(name, child)| {
                self.nodes.get(child).map(|node| DirEntry {
                    name: name.clone(),
                    id: *child,
                    file_type: node.file_type(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Reinsert a node read back from the backend under its original id.
    pub fn restore(&mut self, mut node: Node) -> FsResult<()> {
        if node.id == NodeId::ROOT || self.nodes.contains_key(&node.id) {
            return Err(FsError::AlreadyExists);
        }
        Self::validate_name(&node.name)?;
        if self.attached_dir(node.parent)?.contains_key(&node.name) {
            return Err(FsError::AlreadyExists);
        }
        node.nlink = if node.is_dir() { 2 } else { 1 };
        let (id, parent, name, is_dir) = (node.id, node.parent, node.name.clone(), node.is_dir());
        let parent_times = self.get(parent)?.times;
        self.next_id = self.next_id.max(id.0 + 1);
        self.nodes.insert(id, node);
        self.link(parent, &name, id, is_dir, parent_times.mtime);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.times = parent_times;
        }
        Ok(())
    }
}
