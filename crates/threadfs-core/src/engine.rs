// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem operations executed on the storage thread.
//!
//! The [`Engine`] owns the node table, the open handle table and the storage
//! backend. Each public operation is an `async fn` taking `&mut self`; the
//! operation queue runs one of them to completion, backend sub-steps included,
//! before starting the next, so no operation ever observes another half done.
//! Entries are created in the table first and rolled back if the backend
//! rejects them; entries are removed from the backend first so a failure
//! leaves the tree untouched.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::node::{FileContent, NewNode, Node, NodeKind, NodeTable, Ownership};
use crate::resolve::Resolver;
use crate::storage::{BackendError, ObjectAttributes, StorageBackend};
use crate::types::{
    access, current_timestamp, Attributes, Credentials, DirEntry, FileTimes, FileType, HandleId,
    NodeId, OpenFlags, SetAttributes, Usage, Whence,
};

/// Open file description
#[derive(Debug)]
struct Handle {
    node: NodeId,
    flags: OpenFlags,
    position: u64,
}

pub struct Engine {
    config: FsConfig,
    credentials: Credentials,
    table: NodeTable,
    backend: Box<dyn StorageBackend>,
    handles: HashMap<HandleId, Handle>,
    open_counts: HashMap<NodeId, usize>,
    next_handle: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("credentials", &self.credentials)
            .field("nodes", &self.table.len())
            .field("handles", &self.handles.len())
            .finish()
    }
}

impl Engine {
    /// Attach to `backend`, rebuilding the tree it holds or creating a fresh
    /// root when it is empty.
    pub async fn mount(config: FsConfig, backend: Box<dyn StorageBackend>) -> FsResult<Self> {
        let root_key = NodeId::ROOT.storage_key();
        let (table, existing) = match backend.get_attributes(&root_key).await {
            Ok(attrs) => {
                let owner = Ownership {
                    mode: attrs.mode,
                    uid: attrs.uid,
                    gid: attrs.gid,
                };
                let mut table = NodeTable::with_root(owner, attrs.mtime);
                if let Some(root) = table.lookup_mut(NodeId::ROOT) {
                    root.times = FileTimes {
                        atime: attrs.atime,
                        mtime: attrs.mtime,
                        ctime: attrs.ctime,
                    };
                }
                (table, true)
            }
            Err(BackendError::NotFound(_)) => {
                let security = &config.security;
                let owner = Ownership {
                    mode: security.root_mode,
                    uid: security.root_uid,
                    gid: security.root_gid,
                };
                (NodeTable::with_root(owner, current_timestamp()), false)
            }
            Err(err) => return Err(err.into()),
        };

        let mut engine = Self {
            credentials: config.credentials(),
            config,
            table,
            backend,
            handles: HashMap::new(),
            open_counts: HashMap::new(),
            next_handle: HandleId::FIRST,
        };
        if existing {
            engine.restore_tree().await?;
        } else {
            let attrs = engine.object_attributes(NodeId::ROOT)?;
            engine.backend.create_node(&root_key, &attrs).await?;
        }
        info!(
            target: "threadfs::engine",
            nodes = engine.table.len(),
            restored = existing,
            uid = engine.credentials.uid,
            gid = engine.credentials.gid,
            "filesystem mounted"
        );
        Ok(engine)
    }

    async fn restore_tree(&mut self) -> FsResult<()> {
        let mut queue = VecDeque::from([NodeId::ROOT]);
        while let Some(dir) = queue.pop_front() {
            for key in self.backend.list_children(&dir.storage_key()).await? {
                let id = NodeId::from_storage_key(&key)
                    .ok_or_else(|| FsError::BackendFailure(format!("malformed object key {key}")))?;
                let attrs = self.backend.get_attributes(&key).await?;
                let kind = match attrs.kind {
                    FileType::RegularFile => NodeKind::File(FileContent::with_size(attrs.size)),
                    FileType::Directory => {
                        queue.push_back(id);
                        NodeKind::Directory {
                            children: HashMap::new(),
                        }
                    }
                    FileType::Symlink => NodeKind::Symlink {
                        target: self.backend.read_link_target(&key).await?,
                    },
                };
                self.table.restore(Node {
                    id,
                    parent: dir,
                    name: attrs.name,
                    kind,
                    mode: attrs.mode,
                    uid: attrs.uid,
                    gid: attrs.gid,
                    times: FileTimes {
                        atime: attrs.atime,
                        mtime: attrs.mtime,
                        ctime: attrs.ctime,
                    },
                    nlink: 0,
                })?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    // ---- helpers -------------------------------------------------------

    fn enforcing(&self) -> bool {
        self.config.security.enforce_permissions
    }

    fn resolver(&self) -> Resolver<'_> {
        let resolver = Resolver::new(&self.table, self.config.limits.max_symlink_hops);
        if self.enforcing() {
            resolver.with_credentials(self.credentials)
        } else {
            resolver
        }
    }

    fn resolve(&self, path: &str, cwd: NodeId, follow: bool) -> FsResult<NodeId> {
        self.resolver().resolve(path, cwd, follow)
    }

    fn resolve_parent(&self, path: &str, cwd: NodeId) -> FsResult<(NodeId, String)> {
        self.resolver().resolve_parent(path, cwd)
    }

    fn node(&self, id: NodeId) -> FsResult<&Node> {
        self.table.lookup(id).ok_or(FsError::NotFound)
    }

    fn handle(&self, handle: HandleId) -> FsResult<&Handle> {
        self.handles.get(&handle).ok_or(FsError::BadFileDescriptor)
    }

    fn handle_mut(&mut self, handle: HandleId) -> FsResult<&mut Handle> {
        self.handles.get_mut(&handle).ok_or(FsError::BadFileDescriptor)
    }

    fn check_access(&self, id: NodeId, want: u32) -> FsResult<()> {
        if !self.enforcing() {
            return Ok(());
        }
        let node = self.node(id)?;
        if self.credentials.permits(node.mode, node.uid, node.gid, want) {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    fn is_owner(&self, node: &Node) -> bool {
        !self.enforcing() || self.credentials.is_root() || self.credentials.uid == node.uid
    }

    fn object_attributes(&self, id: NodeId) -> FsResult<ObjectAttributes> {
        let node = self.node(id)?;
        let parent =
            (id != NodeId::ROOT && node.is_attached()).then(|| node.parent.storage_key());
        Ok(ObjectAttributes {
            kind: node.file_type(),
            parent,
            name: node.name.clone(),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            size: node.size(),
            atime: node.times.atime,
            mtime: node.times.mtime,
            ctime: node.times.ctime,
        })
    }

    /// Write a node's attributes through to the backend. Detached nodes are
    /// stored without a parent, so a later mount does not bring them back.
    async fn persist(&self, id: NodeId) -> FsResult<()> {
        let attrs = self.object_attributes(id)?;
        self.backend.set_attributes(&id.storage_key(), &attrs).await?;
        Ok(())
    }

    async fn create_entry(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NewNode,
        mode: u32,
    ) -> FsResult<NodeId> {
        if self.table.child(parent, name).is_ok() {
            return Err(FsError::AlreadyExists);
        }
        self.check_access(parent, access::WRITE | access::EXEC)?;
        let owner = Ownership {
            mode,
            uid: self.credentials.uid,
            gid: self.credentials.gid,
        };
        let target = match &kind {
            NewNode::Symlink(target) => Some(target.clone()),
            _ => None,
        };
        let id = self.table.create_child(parent, name, kind, owner, current_timestamp())?;
        let attrs = self.object_attributes(id)?;
        let key = id.storage_key();
        let stored = match &target {
            Some(target) => self.backend.create_link(&key, target, &attrs).await,
            None => self.backend.create_node(&key, &attrs).await,
        };
        if let Err(err) = stored {
            self.table.remove_child(parent, name, false, current_timestamp())?;
            self.table.forget(id);
            return Err(err.into());
        }
        Ok(id)
    }

    /// Remove a single entry, deleting its backend object unless a handle
    /// still refers to it.
    async fn detach_entry(&mut self, parent: NodeId, name: &str, id: NodeId) -> FsResult<()> {
        let key = id.storage_key();
        if self.open_counts.contains_key(&id) {
            let mut attrs = self.object_attributes(id)?;
            attrs.parent = None;
            self.backend.set_attributes(&key, &attrs).await?;
            self.table.remove_child(parent, name, false, current_timestamp())?;
        } else {
            self.backend.delete_node(&key).await?;
            self.table.remove_child(parent, name, false, current_timestamp())?;
            self.table.forget(id);
        }
        Ok(())
    }

    /// Finish off nodes that were detached by a replacing rename or a tree
    /// removal. Backend failures here are logged; the tree is already updated.
    async fn release(&mut self, ids: Vec<NodeId>) {
        for id in ids {
            let result = if self.open_counts.contains_key(&id) {
                self.persist(id).await
            } else {
                let deleted = self.backend.delete_node(&id.storage_key()).await;
                self.table.forget(id);
                deleted.map_err(FsError::from)
            };
            if let Err(err) = result {
                warn!(target: "threadfs::engine", node = %id, %err, "deferred backend cleanup failed");
            }
        }
    }

    async fn read_at(&self, id: NodeId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let content = self.node(id)?.content()?;
        if len == 0 || offset >= content.size {
            return Ok(Vec::new());
        }
        let n = (content.size - offset).min(len as u64) as usize;
        let mut buf = vec![0u8; n];
        if offset < content.committed {
            let stored_len = (content.committed - offset).min(n as u64) as usize;
            let stored = self.backend.read_bytes(&id.storage_key(), offset, stored_len).await?;
            let k = stored.len().min(n);
            buf[..k].copy_from_slice(&stored[..k]);
        }
        content.overlay(offset, &mut buf);
        Ok(buf)
    }

    async fn write_at(&mut self, id: NodeId, offset: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let now = current_timestamp();
        let limit = self.config.limits.write_buffer_bytes;
        let node = self.table.lookup_mut(id).ok_or(FsError::NotFound)?;
        let content = node.content_mut()?;
        content.stage(offset, data);
        let over_limit = content.pending_bytes > limit;
        node.times.mtime = now;
        node.times.ctime = now;
        // The bytes are staged either way; a failed flush stays queued and is
        // reported by the next fsync or close.
        if over_limit {
            if let Err(err) = self.commit(id).await {
                warn!(target: "threadfs::engine", node = %id, %err, "buffer flush failed, writes kept");
            }
        }
        Ok(data.len())
    }

    /// Push a file's pending writes to the backend. On failure every write of
    /// the attempt stays pending for the next one.
    async fn commit(&mut self, id: NodeId) -> FsResult<()> {
        let Some(content) = self.table.lookup_mut(id).and_then(|n| n.content_mut().ok()) else {
            return Ok(());
        };
        if content.pending.is_empty() {
            return Ok(());
        }
        let committed = content.committed;
        let writes = content.take_pending();
        let key = id.storage_key();
        let mut bytes = 0usize;
        let mut failure = None;
        for write in &writes {
            if let Err(err) = self.backend.write_bytes(&key, write.offset, &write.data).await {
                failure = Some(err);
                break;
            }
            bytes += write.data.len();
        }
        if let Some(err) = failure {
            if let Some(content) = self.table.lookup_mut(id).and_then(|n| n.content_mut().ok()) {
                content.requeue(writes, committed);
            }
            return Err(err.into());
        }
        debug!(target: "threadfs::engine", node = %id, writes = writes.len(), bytes, "committed pending writes");
        self.persist(id).await
    }

    async fn set_size(&mut self, id: NodeId, size: u64) -> FsResult<()> {
        self.commit(id).await?;
        let delta = SetAttributes {
            size: Some(size),
            ..Default::default()
        };
        self.table.set_attributes(id, &delta, current_timestamp())?;
        self.persist(id).await?;
        if let Some(content) = self.table.lookup_mut(id).and_then(|n| n.content_mut().ok()) {
            content.committed = size;
        }
        Ok(())
    }

    fn allocate_handle(&mut self, node: NodeId, flags: OpenFlags) -> HandleId {
        let id = HandleId::new(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(
            id,
            Handle {
                node,
                flags,
                position: 0,
            },
        );
        *self.open_counts.entry(node).or_insert(0) += 1;
        id
    }

    // ---- namespace operations -------------------------------------------

    pub async fn mkdir(&mut self, path: &str, cwd: NodeId, mode: u32) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, mode = %format!("{mode:o}"), "mkdir");
        let (parent, name) = self.resolve_parent(path, cwd)?;
        self.create_entry(parent, &name, NewNode::Directory, mode).await?;
        Ok(())
    }

    pub async fn rmdir(&mut self, path: &str, cwd: NodeId) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, "rmdir");
        let (parent, name) = self.resolve_parent(path, cwd)?;
        match name.as_str() {
            "." => return Err(FsError::InvalidArgument),
            ".." => return Err(FsError::NotEmpty),
            _ => {}
        }
        let id = self.table.child(parent, &name)?;
        if !self.node(id)?.children()?.is_empty() {
            return Err(FsError::NotEmpty);
        }
        self.check_access(parent, access::WRITE | access::EXEC)?;
        self.detach_entry(parent, &name, id).await
    }

    pub async fn unlink(&mut self, path: &str, cwd: NodeId) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, "unlink");
        let (parent, name) = self.resolve_parent(path, cwd)?;
        if name == "." || name == ".." {
            return Err(FsError::IsADirectory);
        }
        let id = self.table.child(parent, &name)?;
        if self.node(id)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if path.ends_with('/') {
            return Err(FsError::NotADirectory);
        }
        self.check_access(parent, access::WRITE | access::EXEC)?;
        self.detach_entry(parent, &name, id).await
    }

    /// Remove `path` and everything below it.
    pub async fn remove_tree(&mut self, path: &str, cwd: NodeId) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, "remove_tree");
        let (parent, name) = self.resolve_parent(path, cwd)?;
        self.table.child(parent, &name)?;
        self.check_access(parent, access::WRITE | access::EXEC)?;
        let removed = self.table.remove_child(parent, &name, true, current_timestamp())?;
        self.release(removed).await;
        Ok(())
    }

    pub async fn rename(&mut self, from: &str, to: &str, cwd: NodeId) -> FsResult<()> {
        debug!(target: "threadfs::engine", from, to, "rename");
        let (src_parent, src_name) = self.resolve_parent(from, cwd)?;
        let (dst_parent, dst_name) = self.resolve_parent(to, cwd)?;
        let src = self.table.child(src_parent, &src_name)?;
        if (from.ends_with('/') || to.ends_with('/')) && !self.node(src)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.check_access(src_parent, access::WRITE | access::EXEC)?;
        self.check_access(dst_parent, access::WRITE | access::EXEC)?;

        let replaced =
            self.table
                .move_child(src_parent, &src_name, dst_parent, &dst_name, current_timestamp())?;
        // The move stands even if the backend rejects it.
        let persisted = self.persist(src).await;
        if let Some(replaced) = replaced {
            self.release(vec![replaced]).await;
        }
        persisted
    }

    pub async fn symlink(&mut self, target: &str, link: &str, cwd: NodeId) -> FsResult<()> {
        debug!(target: "threadfs::engine", link, target, "symlink");
        let (parent, name) = self.resolve_parent(link, cwd)?;
        self.create_entry(parent, &name, NewNode::Symlink(target.to_string()), 0o777).await?;
        Ok(())
    }

    /// Create an empty regular file under a name that must not exist yet.
    pub async fn mknod(&mut self, path: &str, cwd: NodeId, mode: u32) -> FsResult<()> {
        let flags = OpenFlags {
            create: true,
            exclusive: true,
            ..Default::default()
        };
        let handle = self.open(path, cwd, flags, mode).await?;
        self.close(handle).await
    }

    pub async fn readlink(&mut self, path: &str, cwd: NodeId) -> FsResult<String> {
        let id = self.resolve(path, cwd, false)?;
        match &self.node(id)?.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    // ---- attributes -----------------------------------------------------

    pub async fn stat(&mut self, path: &str, cwd: NodeId) -> FsResult<Attributes> {
        let id = self.resolve(path, cwd, true)?;
        self.table.get_attributes(id)
    }

    pub async fn lstat(&mut self, path: &str, cwd: NodeId) -> FsResult<Attributes> {
        let id = self.resolve(path, cwd, false)?;
        self.table.get_attributes(id)
    }

    pub async fn fstat(&mut self, handle: HandleId) -> FsResult<Attributes> {
        let node = self.handle(handle)?.node;
        self.table.get_attributes(node)
    }

    /// Set access and modification times; `None` means now. Explicit times
    /// need ownership, "now" also accepts write permission.
    pub async fn utime(
        &mut self,
        path: &str,
        cwd: NodeId,
        times: Option<(i64, i64)>,
    ) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, ?times, "utime");
        let id = self.resolve(path, cwd, true)?;
        if !self.is_owner(self.node(id)?) {
            match times {
                Some(_) => return Err(FsError::PermissionDenied),
                None => self.check_access(id, access::WRITE)?,
            }
        }
        let now = current_timestamp();
        let (atime, mtime) = times.unwrap_or((now, now));
        let delta = SetAttributes {
            atime: Some(atime),
            mtime: Some(mtime),
            ..Default::default()
        };
        self.table.set_attributes(id, &delta, now)?;
        self.persist(id).await
    }

    async fn change_mode(&mut self, id: NodeId, mode: u32) -> FsResult<()> {
        if !self.is_owner(self.node(id)?) {
            return Err(FsError::PermissionDenied);
        }
        let delta = SetAttributes {
            mode: Some(mode),
            ..Default::default()
        };
        self.table.set_attributes(id, &delta, current_timestamp())?;
        self.persist(id).await
    }

    pub async fn chmod(&mut self, path: &str, cwd: NodeId, mode: u32) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, mode = %format!("{mode:o}"), "chmod");
        let id = self.resolve(path, cwd, true)?;
        self.change_mode(id, mode).await
    }

    pub async fn fchmod(&mut self, handle: HandleId, mode: u32) -> FsResult<()> {
        let id = self.handle(handle)?.node;
        self.change_mode(id, mode).await
    }

    /// Only root may give a file away; the owner may move it to their own group.
    pub async fn chown(
        &mut self,
        path: &str,
        cwd: NodeId,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, ?uid, ?gid, "chown");
        let id = self.resolve(path, cwd, true)?;
        self.change_owner(id, uid, gid).await
    }

    /// Like [`Engine::chown`] but changes a final symlink itself.
    pub async fn lchown(
        &mut self,
        path: &str,
        cwd: NodeId,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, ?uid, ?gid, "lchown");
        let id = self.resolve(path, cwd, false)?;
        self.change_owner(id, uid, gid).await
    }

    pub async fn fchown(
        &mut self,
        handle: HandleId,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        let id = self.handle(handle)?.node;
        self.change_owner(id, uid, gid).await
    }

    async fn change_owner(&mut self, id: NodeId, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let node = self.node(id)?;
        if self.enforcing() && !self.credentials.is_root() {
            let uid_changes = uid.is_some_and(|uid| uid != node.uid);
            let gid_allowed = gid.map_or(true, |gid| {
                gid == node.gid || (self.credentials.uid == node.uid && gid == self.credentials.gid)
            });
            if uid_changes || !gid_allowed {
                return Err(FsError::PermissionDenied);
            }
        }
        let delta = SetAttributes {
            uid,
            gid,
            ..Default::default()
        };
        self.table.set_attributes(id, &delta, current_timestamp())?;
        self.persist(id).await
    }

    /// Check `want` (a combination of [`access`] bits, zero for existence).
    pub async fn access(&mut self, path: &str, cwd: NodeId, want: u32) -> FsResult<()> {
        let id = self.resolve(path, cwd, true)?;
        if want == 0 {
            return Ok(());
        }
        self.check_access(id, want)
    }

    pub async fn truncate(&mut self, path: &str, cwd: NodeId, size: u64) -> FsResult<()> {
        debug!(target: "threadfs::engine", path, size, "truncate");
        let id = self.resolve(path, cwd, true)?;
        self.node(id)?.content()?;
        self.check_access(id, access::WRITE)?;
        self.set_size(id, size).await
    }

    pub async fn ftruncate(&mut self, handle: HandleId, size: u64) -> FsResult<()> {
        let handle = self.handle(handle)?;
        if !handle.flags.write {
            return Err(FsError::InvalidArgument);
        }
        let id = handle.node;
        self.node(id)?.content()?;
        self.set_size(id, size).await
    }

    /// Grow the file open at `handle` to at least `end` bytes.
    pub async fn allocate(&mut self, handle: HandleId, end: u64) -> FsResult<()> {
        let handle = self.handle(handle)?;
        if !handle.flags.write {
            return Err(FsError::BadFileDescriptor);
        }
        let id = handle.node;
        if self.node(id)?.content()?.size >= end {
            return Ok(());
        }
        self.set_size(id, end).await
    }

    // ---- handles --------------------------------------------------------

    pub async fn open(
        &mut self,
        path: &str,
        cwd: NodeId,
        flags: OpenFlags,
        mode: u32,
    ) -> FsResult<HandleId> {
        debug!(target: "threadfs::engine", path, ?flags, "open");
        let mut created = false;
        let id = match self.resolve(path, cwd, !flags.nofollow) {
            Ok(_) if flags.create && flags.exclusive => return Err(FsError::AlreadyExists),
            Ok(id) => id,
            Err(FsError::NotFound) if flags.create => {
                if path.ends_with('/') {
                    return Err(FsError::IsADirectory);
                }
                let (parent, name) = self.resolve_parent(path, cwd)?;
                if self.table.child(parent, &name).is_ok() {
                    // The final component is a dangling symlink.
                    return Err(if flags.exclusive {
                        FsError::AlreadyExists
                    } else {
                        FsError::NotFound
                    });
                }
                created = true;
                self.create_entry(parent, &name, NewNode::File, mode).await?
            }
            Err(err) => return Err(err),
        };

        let node = self.node(id)?;
        match node.file_type() {
            FileType::Symlink => return Err(FsError::TooManySymlinks),
            FileType::Directory if flags.write || flags.truncate => {
                return Err(FsError::IsADirectory)
            }
            FileType::RegularFile if flags.directory => return Err(FsError::NotADirectory),
            _ => {}
        }
        if !created {
            let mut want = 0;
            if flags.read {
                want |= access::READ;
            }
            if flags.write {
                want |= access::WRITE;
            }
            self.check_access(id, want)?;
            if flags.truncate && flags.write && node.size() > 0 {
                self.set_size(id, 0).await?;
            }
        }
        Ok(self.allocate_handle(id, flags))
    }

    /// Drop a handle. The last close of a node commits its pending writes,
    /// or deletes it when it was unlinked while open.
    pub async fn close(&mut self, handle: HandleId) -> FsResult<()> {
        let Handle { node, .. } = self.handles.remove(&handle).ok_or(FsError::BadFileDescriptor)?;
        let remaining = match self.open_counts.get_mut(&node) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return Ok(());
        }
        self.open_counts.remove(&node);
        if self.table.lookup(node).is_some_and(Node::is_attached) {
            return self.commit(node).await;
        }
        if let Err(err) = self.backend.delete_node(&node.storage_key()).await {
            warn!(target: "threadfs::engine", node = %node, %err, "failed to delete unlinked node on close");
        }
        self.table.forget(node);
        Ok(())
    }

    pub async fn read(&mut self, handle: HandleId, len: usize) -> FsResult<Vec<u8>> {
        let h = self.handle(handle)?;
        if !h.flags.read {
            return Err(FsError::BadFileDescriptor);
        }
        let (node, position) = (h.node, h.position);
        let data = self.read_at(node, position, len).await?;
        self.handle_mut(handle)?.position = position + data.len() as u64;
        Ok(data)
    }

    pub async fn write(&mut self, handle: HandleId, data: &[u8]) -> FsResult<usize> {
        let h = self.handle(handle)?;
        if !h.flags.write {
            return Err(FsError::BadFileDescriptor);
        }
        let node = h.node;
        let offset = if h.flags.append { self.node(node)?.size() } else { h.position };
        let written = self.write_at(node, offset, data).await?;
        self.handle_mut(handle)?.position = offset + written as u64;
        Ok(written)
    }

    pub async fn pread(&mut self, handle: HandleId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let h = self.handle(handle)?;
        if !h.flags.read {
            return Err(FsError::BadFileDescriptor);
        }
        let node = h.node;
        self.read_at(node, offset, len).await
    }

    pub async fn pwrite(&mut self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let h = self.handle(handle)?;
        if !h.flags.write {
            return Err(FsError::BadFileDescriptor);
        }
        let node = h.node;
        self.write_at(node, offset, data).await
    }

    pub async fn seek(&mut self, handle: HandleId, offset: i64, whence: Whence) -> FsResult<u64> {
        let h = self.handle(handle)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => h.position,
            Whence::End => self.node(h.node)?.size(),
        };
        let position = i128::from(base) + i128::from(offset);
        let position = u64::try_from(position).map_err(|_| FsError::InvalidArgument)?;
        self.handle_mut(handle)?.position = position;
        Ok(position)
    }

    pub async fn fsync(&mut self, handle: HandleId) -> FsResult<()> {
        let node = self.handle(handle)?.node;
        self.commit(node).await
    }

    /// Flags the handle was opened with, as changed since by
    /// [`Engine::set_append`].
    pub async fn handle_flags(&mut self, handle: HandleId) -> FsResult<OpenFlags> {
        Ok(self.handle(handle)?.flags)
    }

    /// Switch append mode on an open handle. No other flag can change after
    /// open.
    pub async fn set_append(&mut self, handle: HandleId, append: bool) -> FsResult<()> {
        self.handle_mut(handle)?.flags.append = append;
        Ok(())
    }

    /// Nodes in the tree and bytes held by its files, unlinked open files
    /// included.
    pub async fn usage(&mut self) -> FsResult<Usage> {
        Ok(self.table.usage())
    }

    /// Directory entries not yet returned through this handle, `.` and `..`
    /// included. An empty result means the end of the directory.
    pub async fn read_dir(&mut self, handle: HandleId) -> FsResult<Vec<DirEntry>> {
        let (id, position) = {
            let h = self.handle(handle)?;
            (h.node, h.position)
        };
        let node = self.node(id)?;
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                id,
                file_type: FileType::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                id: node.parent,
                file_type: FileType::Directory,
            },
        ];
        entries.extend(self.table.read_dir(id)?);
        let total = entries.len();
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(total);
        let rest = entries.split_off(start);
        self.handle_mut(handle)?.position = total as u64;
        Ok(rest)
    }

    // ---- working directory ----------------------------------------------

    pub async fn chdir(&mut self, path: &str, cwd: NodeId) -> FsResult<NodeId> {
        let id = self.resolve(path, cwd, true)?;
        self.enter_dir(id)
    }

    pub async fn fchdir(&mut self, handle: HandleId) -> FsResult<NodeId> {
        let id = self.handle(handle)?.node;
        self.enter_dir(id)
    }

    fn enter_dir(&self, id: NodeId) -> FsResult<NodeId> {
        if !self.node(id)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.check_access(id, access::EXEC)?;
        Ok(id)
    }

    pub async fn path_of(&mut self, id: NodeId) -> FsResult<String> {
        self.table.path_of(id)
    }

    // ---- lifecycle ------------------------------------------------------

    /// Commit every file's pending writes. Keeps going past failures and
    /// reports the first one.
    pub async fn flush_all(&mut self) -> FsResult<()> {
        let mut first_error = None;
        for id in self.table.dirty_files() {
            if let Err(err) = self.commit(id).await {
                warn!(target: "threadfs::engine", node = %id, %err, "flush failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush everything and close all handles ahead of the storage thread exiting.
    pub async fn shutdown(&mut self) -> FsResult<()> {
        let flushed = self.flush_all().await;
        let mut handles: Vec<HandleId> = self.handles.keys().copied().collect();
        handles.sort_by_key(|h| h.0);
        let closed = handles.len();
        for handle in handles {
            if let Err(err) = self.close(handle).await {
                warn!(target: "threadfs::engine", ?handle, %err, "close at shutdown failed");
            }
        }
        info!(target: "threadfs::engine", closed_handles = closed, nodes = self.table.len(), "filesystem shut down");
        flushed
    }
}
