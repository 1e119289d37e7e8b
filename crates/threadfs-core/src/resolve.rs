// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path resolution over the node table

use crate::error::{FsError, FsResult};
use crate::node::{NodeKind, NodeTable};
use crate::types::{access, Credentials, NodeId};

/// Walks paths against a borrowed [`NodeTable`].
///
/// The walk keeps an explicit stack of pending components and splices symlink
/// targets onto it, so arbitrarily deep chains never grow the call stack. The
/// number of expansions per call is capped by `max_hops`.
pub struct Resolver<'a> {
    table: &'a NodeTable,
    max_hops: u32,
    credentials: Option<Credentials>,
}

impl<'a> Resolver<'a> {
    pub fn new(table: &'a NodeTable, max_hops: u32) -> Self {
        Self {
            table,
            max_hops,
            credentials: None,
        }
    }

    /// Require search permission on every directory traversed.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn resolve(&self, path: &str, cwd: NodeId, follow_final: bool) -> FsResult<NodeId> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let must_be_dir = path.ends_with('/');
        let follow_final = follow_final || must_be_dir;

        let mut current = if path.starts_with('/') { self.table.root() } else { cwd };
        if self.table.lookup(current).is_none() {
            return Err(FsError::NotFound);
        }

        let mut pending: Vec<&str> = components(path).rev().collect();
        let mut hops = 0u32;

        while let Some(name) = pending.pop() {
            let dir = self.table.lookup(current).ok_or(FsError::NotFound)?;
            let children = dir.children()?;
            self.check_search(current)?;

            if name == ".." {
                current = dir.parent;
                continue;
            }

            let child = *children.get(name).ok_or(FsError::NotFound)?;
            let child_node = self.table.lookup(child).ok_or(FsError::NotFound)?;
            if let NodeKind::Symlink { target } = &child_node.kind {
                if !pending.is_empty() || follow_final {
                    hops += 1;
                    if hops > self.max_hops {
                        return Err(FsError::TooManySymlinks);
                    }
                    if target.is_empty() {
                        return Err(FsError::NotFound);
                    }
                    if target.starts_with('/') {
                        current = self.table.root();
                    }
                    pending.extend(components(target).rev());
                    continue;
                }
            }
            current = child;
        }

        if must_be_dir {
            let node = self.table.lookup(current).ok_or(FsError::NotFound)?;
            if !node.is_dir() {
                return Err(FsError::NotADirectory);
            }
        }
        Ok(current)
    }

    /// Resolve everything but the final component, which is returned as-is.
    /// A path naming the root yields `(root, ".")`.
    pub fn resolve_parent(&self, path: &str, cwd: NodeId) -> FsResult<(NodeId, String)> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok((self.table.root(), ".".to_string()));
        }
        let (dir, name) = match trimmed.rfind('/') {
            Some(idx) => {
                let dir = &trimmed[..idx];
                (if dir.is_empty() { "/" } else { dir }, &trimmed[idx + 1..])
            }
            None => (".", trimmed),
        };
        let parent = self.resolve(dir, cwd, true)?;
        let node = self.table.lookup(parent).ok_or(FsError::NotFound)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok((parent, name.to_string()))
    }

    fn check_search(&self, dir: NodeId) -> FsResult<()> {
        let Some(credentials) = self.credentials else {
            return Ok(());
        };
        let node = self.table.lookup(dir).ok_or(FsError::NotFound)?;
        if credentials.permits(node.mode, node.uid, node.gid, access::EXEC) {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }
}

fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NewNode, Ownership};

    const OWNER: Ownership = Ownership {
        mode: 0o755,
        uid: 1000,
        gid: 1000,
    };

    struct Tree {
        table: NodeTable,
        a: NodeId,
        b: NodeId,
        file: NodeId,
    }

    /// `/a/b/file`, plus `/a/up -> ..` and `/abs -> /a/b`
    fn tree() -> Tree {
        let mut table = NodeTable::with_root(OWNER, 0);
        let a = table.create_child(table.root(), "a", NewNode::Directory, OWNER, 0).unwrap();
        let b = table.create_child(a, "b", NewNode::Directory, OWNER, 0).unwrap();
        let file = table.create_child(b, "file", NewNode::File, OWNER, 0).unwrap();
        table.create_child(a, "up", NewNode::Symlink("..".into()), OWNER, 0).unwrap();
        table.create_child(table.root(), "abs", NewNode::Symlink("/a/b".into()), OWNER, 0).unwrap();
        Tree { table, a, b, file }
    }

    #[test]
    fn resolves_absolute_and_relative_paths() {
        let t = tree();
        let r = Resolver::new(&t.table, 40);
        assert_eq!(r.resolve("/a/b/file", NodeId::ROOT, true).unwrap(), t.file);
        assert_eq!(r.resolve("b/file", t.a, true).unwrap(), t.file);
        assert_eq!(r.resolve("./b/../b/./file", t.a, true).unwrap(), t.file);
        assert_eq!(r.resolve("/..", t.b, true).unwrap(), NodeId::ROOT);
        assert_eq!(r.resolve("..", t.b, true).unwrap(), t.a);
        assert_eq!(r.resolve("//a///b", NodeId::ROOT, true).unwrap(), t.b);
    }

    #[test]
    fn path_of_round_trips() {
        let t = tree();
        let r = Resolver::new(&t.table, 40);
        for id in [t.a, t.b, t.file] {
            let path = t.table.path_of(id).unwrap();
            assert_eq!(r.resolve(&path, NodeId::ROOT, false).unwrap(), id);
        }
    }

    #[test]
    fn follows_symlinks_relative_to_their_directory() {
        let t = tree();
        let r = Resolver::new(&t.table, 40);
        assert_eq!(r.resolve("/a/up/a/b/file", NodeId::ROOT, true).unwrap(), t.file);
        assert_eq!(r.resolve("/abs/file", NodeId::ROOT, true).unwrap(), t.file);
        assert_eq!(r.resolve("/abs", NodeId::ROOT, true).unwrap(), t.b);
        let link = r.resolve("/abs", NodeId::ROOT, false).unwrap();
        assert!(matches!(t.table.lookup(link).unwrap().kind, NodeKind::Symlink { .. }));
    }

    #[test]
    fn trailing_slash_follows_and_requires_directory() {
        let t = tree();
        let r = Resolver::new(&t.table, 40);
        assert_eq!(r.resolve("/abs/", NodeId::ROOT, false).unwrap(), t.b);
        assert_eq!(r.resolve("/a/b/file/", NodeId::ROOT, true), Err(FsError::NotADirectory));
    }

    #[test]
    fn reports_missing_and_non_directory_components() {
        let t = tree();
        let r = Resolver::new(&t.table, 40);
        assert_eq!(r.resolve("", NodeId::ROOT, true), Err(FsError::NotFound));
        assert_eq!(r.resolve("/a/missing/x", NodeId::ROOT, true), Err(FsError::NotFound));
        assert_eq!(r.resolve("/a/b/file/x", NodeId::ROOT, true), Err(FsError::NotADirectory));
    }

    #[test]
    fn symlink_cycles_are_bounded() {
        let mut t = tree();
        let root = t.table.root();
        t.table.create_child(root, "loop1", NewNode::Symlink("loop2".into()), OWNER, 0).unwrap();
        t.table.create_child(root, "loop2", NewNode::Symlink("/loop1".into()), OWNER, 0).unwrap();
        t.table.create_child(root, "self", NewNode::Symlink("self/x".into()), OWNER, 0).unwrap();
        let r = Resolver::new(&t.table, 40);
        assert_eq!(r.resolve("/loop1", root, true), Err(FsError::TooManySymlinks));
        assert_eq!(r.resolve("/loop1/x", root, false), Err(FsError::TooManySymlinks));
        assert_eq!(r.resolve("/self", root, true), Err(FsError::TooManySymlinks));
        assert!(r.resolve("/loop1", root, false).is_ok());
    }

    #[test]
    fn hop_limit_is_configurable() {
        let mut t = tree();
        let root = t.table.root();
        t.table.create_child(root, "l1", NewNode::Symlink("abs".into()), OWNER, 0).unwrap();
        t.table.create_child(root, "l2", NewNode::Symlink("l1".into()), OWNER, 0).unwrap();
        assert_eq!(Resolver::new(&t.table, 3).resolve("/l2/file", root, true).unwrap(), t.file);
        assert_eq!(
            Resolver::new(&t.table, 2).resolve("/l2/file", root, true),
            Err(FsError::TooManySymlinks)
        );
    }

    #[test]
    fn dangling_and_empty_targets_are_not_found() {
        let mut t = tree();
        let root = t.table.root();
        t.table.create_child(root, "dangling", NewNode::Symlink("nowhere".into()), OWNER, 0).unwrap();
        t.table.create_child(root, "empty", NewNode::Symlink(String::new()), OWNER, 0).unwrap();
        let r = Resolver::new(&t.table, 40);
        assert_eq!(r.resolve("/dangling", root, true), Err(FsError::NotFound));
        assert_eq!(r.resolve("/empty", root, true), Err(FsError::NotFound));
        assert!(r.resolve("/dangling", root, false).is_ok());
    }

    #[test]
    fn resolve_parent_splits_final_component() {
        let t = tree();
        let r = Resolver::new(&t.table, 40);
        assert_eq!(r.resolve_parent("/a/b/new", NodeId::ROOT).unwrap(), (t.b, "new".to_string()));
        assert_eq!(r.resolve_parent("new/", t.a).unwrap(), (t.a, "new".to_string()));
        assert_eq!(r.resolve_parent("/top", t.b).unwrap(), (NodeId::ROOT, "top".to_string()));
        assert_eq!(r.resolve_parent("/abs/x", NodeId::ROOT).unwrap(), (t.b, "x".to_string()));
        assert_eq!(r.resolve_parent("/", t.b).unwrap(), (NodeId::ROOT, ".".to_string()));
        assert_eq!(r.resolve_parent("/a/b/file/x", NodeId::ROOT), Err(FsError::NotADirectory));
        assert_eq!(r.resolve_parent("/nope/x", NodeId::ROOT), Err(FsError::NotFound));
    }

    #[test]
    fn search_permission_is_checked_per_directory() {
        let mut t = tree();
        t.table.lookup_mut(t.a).unwrap().mode = 0o700;
        t.table.lookup_mut(t.a).unwrap().uid = 0;
        let stranger = Credentials { uid: 2000, gid: 2000 };
        let r = Resolver::new(&t.table, 40).with_credentials(stranger);
        assert_eq!(r.resolve("/a/b/file", NodeId::ROOT, true), Err(FsError::PermissionDenied));
        assert_eq!(r.resolve("/a", NodeId::ROOT, true).unwrap(), t.a);

        let root = Credentials { uid: 0, gid: 0 };
        let r = Resolver::new(&t.table, 40).with_credentials(root);
        assert_eq!(r.resolve("/a/b/file", NodeId::ROOT, true).unwrap(), t.file);
    }
}
