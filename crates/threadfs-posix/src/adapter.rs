// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! POSIX-shaped calls over a [`Bridge`].
//!
//! Every call checks what it can locally, crosses the bridge once (twice
//! for an `open` whose fd does not fit), and on failure records the errno for
//! the calling thread before returning it.

use std::thread::JoinHandle;

use futures::future::{FutureExt, LocalBoxFuture};
use libc::c_int;
use threadfs_core::{Bridge, Engine, FsError, FsResult, HandleId, NodeId, Whence};
use tracing::debug;

use crate::abi::{self, Stat, Statfs, UtimBuf};
use crate::cwd;
use crate::errno::{Errno, PosixResult};

/// Passed as a uid or gid to `chown` to leave it unchanged.
pub const UNCHANGED_ID: u32 = u32::MAX;

fn check_path(path: &str) -> PosixResult<()> {
    if path.is_empty() {
        return Err(Errno::raise(libc::ENOENT));
    }
    if path.contains('\0') {
        return Err(Errno::raise(libc::EINVAL));
    }
    Ok(())
}

fn handle(fd: c_int) -> PosixResult<HandleId> {
    u64::try_from(fd).map(HandleId::new).map_err(|_| Errno::raise(libc::EBADF))
}

fn owner_ids(uid: u32, gid: u32) -> (Option<u32>, Option<u32>) {
    ((uid != UNCHANGED_ID).then_some(uid), (gid != UNCHANGED_ID).then_some(gid))
}

fn non_negative(value: i64) -> PosixResult<u64> {
    u64::try_from(value).map_err(|_| Errno::raise(libc::EINVAL))
}

#[derive(Clone, Debug)]
pub struct Posix {
    bridge: Bridge,
}

impl Posix {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    fn cwd(&self) -> NodeId {
        cwd::current(self.bridge.id())
    }

    fn call<T, F>(&self, name: &'static str, op: F) -> PosixResult<T>
    where
        T: Send + 'static,
        F: for<'e> FnOnce(&'e mut Engine) -> LocalBoxFuture<'e, FsResult<T>> + Send + 'static,
    {
        self.bridge.invoke(name, op).map_err(|err| {
            let errno = Errno::from(&err);
            debug!(target: "threadfs::posix", name, %err, errno = errno.0, "call failed");
            errno
        })
    }

    /// Start a thread that inherits this thread's working directories.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(Posix) -> T + Send + 'static,
        T: Send + 'static,
    {
        let dirs = cwd::snapshot();
        let posix = self.clone();
        std::thread::spawn(move || {
            cwd::install(dirs);
            f(posix)
        })
    }

    // ---- attributes -----------------------------------------------------

    pub fn stat(&self, path: &str) -> PosixResult<Stat> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let attrs = self.call("stat", move |engine| {
            async move { engine.stat(&path, cwd).await }.boxed_local()
        })?;
        Ok(Stat::from(&attrs))
    }

    pub fn lstat(&self, path: &str) -> PosixResult<Stat> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let attrs = self.call("lstat", move |engine| {
            async move { engine.lstat(&path, cwd).await }.boxed_local()
        })?;
        Ok(Stat::from(&attrs))
    }

    pub fn fstat(&self, fd: c_int) -> PosixResult<Stat> {
        let fd = handle(fd)?;
        let attrs = self.call("fstat", move |engine| engine.fstat(fd).boxed_local())?;
        Ok(Stat::from(&attrs))
    }

    /// Set access and modification times, or both to now when `times` is
    /// `None`. The owner needs no write permission.
    pub fn utime(&self, path: &str, times: Option<&UtimBuf>) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let times = times.map(|t| (t.actime, t.modtime));
        self.call("utime", move |engine| {
            async move { engine.utime(&path, cwd, times).await }.boxed_local()
        })
    }

    pub fn chmod(&self, path: &str, mode: u32) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let mode = mode & 0o7777;
        self.call("chmod", move |engine| {
            async move { engine.chmod(&path, cwd, mode).await }.boxed_local()
        })
    }

    pub fn fchmod(&self, fd: c_int, mode: u32) -> PosixResult<()> {
        let fd = handle(fd)?;
        let mode = mode & 0o7777;
        self.call("fchmod", move |engine| engine.fchmod(fd, mode).boxed_local())
    }

    /// [`UNCHANGED_ID`] leaves the uid or gid as it is.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let (uid, gid) = owner_ids(uid, gid);
        self.call("chown", move |engine| {
            async move { engine.chown(&path, cwd, uid, gid).await }.boxed_local()
        })
    }

    /// `chown` without following a final symlink.
    pub fn lchown(&self, path: &str, uid: u32, gid: u32) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let (uid, gid) = owner_ids(uid, gid);
        self.call("lchown", move |engine| {
            async move { engine.lchown(&path, cwd, uid, gid).await }.boxed_local()
        })
    }

    pub fn fchown(&self, fd: c_int, uid: u32, gid: u32) -> PosixResult<()> {
        let fd = handle(fd)?;
        let (uid, gid) = owner_ids(uid, gid);
        self.call("fchown", move |engine| engine.fchown(fd, uid, gid).boxed_local())
    }

    /// Usage of the whole tree; `path` only has to resolve.
    pub fn statfs(&self, path: &str) -> PosixResult<Statfs> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let usage = self.call("statfs", move |engine| {
            async move {
                engine.stat(&path, cwd).await?;
                engine.usage().await
            }
            .boxed_local()
        })?;
        Ok(Statfs::from(usage))
    }

    pub fn fstatfs(&self, fd: c_int) -> PosixResult<Statfs> {
        let fd = handle(fd)?;
        let usage = self.call("fstatfs", move |engine| {
            async move {
                engine.fstat(fd).await?;
                engine.usage().await
            }
            .boxed_local()
        })?;
        Ok(Statfs::from(usage))
    }

    pub fn access(&self, path: &str, mode: c_int) -> PosixResult<()> {
        check_path(path)?;
        if mode & !(libc::R_OK | libc::W_OK | libc::X_OK) != 0 {
            return Err(Errno::raise(libc::EINVAL));
        }
        let (path, cwd) = (path.to_owned(), self.cwd());
        let want = mode as u32;
        self.call("access", move |engine| {
            async move { engine.access(&path, cwd, want).await }.boxed_local()
        })
    }

    pub fn truncate(&self, path: &str, length: i64) -> PosixResult<()> {
        check_path(path)?;
        let length = non_negative(length)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        self.call("truncate", move |engine| {
            async move { engine.truncate(&path, cwd, length).await }.boxed_local()
        })
    }

    pub fn ftruncate(&self, fd: c_int, length: i64) -> PosixResult<()> {
        let fd = handle(fd)?;
        let length = non_negative(length)?;
        self.call("ftruncate", move |engine| engine.ftruncate(fd, length).boxed_local())
    }

    // ---- namespace ------------------------------------------------------

    pub fn mkdir(&self, path: &str, mode: u32) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let mode = mode & 0o7777;
        self.call("mkdir", move |engine| {
            async move { engine.mkdir(&path, cwd, mode).await }.boxed_local()
        })
    }

    pub fn rmdir(&self, path: &str) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        self.call("rmdir", move |engine| {
            async move { engine.rmdir(&path, cwd).await }.boxed_local()
        })
    }

    pub fn unlink(&self, path: &str) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        self.call("unlink", move |engine| {
            async move { engine.unlink(&path, cwd).await }.boxed_local()
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> PosixResult<()> {
        check_path(from)?;
        check_path(to)?;
        let (from, to, cwd) = (from.to_owned(), to.to_owned(), self.cwd());
        self.call("rename", move |engine| {
            async move { engine.rename(&from, &to, cwd).await }.boxed_local()
        })
    }

    /// `target` is stored as given and only interpreted when the link is
    /// followed.
    pub fn symlink(&self, target: &str, link: &str) -> PosixResult<()> {
        check_path(link)?;
        if target.is_empty() {
            return Err(Errno::raise(libc::ENOENT));
        }
        if target.contains('\0') {
            return Err(Errno::raise(libc::EINVAL));
        }
        let (target, link, cwd) = (target.to_owned(), link.to_owned(), self.cwd());
        self.call("symlink", move |engine| {
            async move { engine.symlink(&target, &link, cwd).await }.boxed_local()
        })
    }

    /// Only regular files can be created; `dev` is ignored.
    pub fn mknod(&self, path: &str, mode: u32, _dev: u64) -> PosixResult<()> {
        check_path(path)?;
        let kind = mode & libc::S_IFMT;
        if kind != 0 && kind != libc::S_IFREG {
            return Err(Errno::raise(libc::EINVAL));
        }
        let (path, cwd) = (path.to_owned(), self.cwd());
        let mode = mode & 0o7777;
        self.call("mknod", move |engine| {
            async move { engine.mknod(&path, cwd, mode).await }.boxed_local()
        })
    }

    /// Copy the link target into `buf`, truncated to its length and without
    /// a terminator. Returns the number of bytes copied.
    pub fn readlink(&self, path: &str, buf: &mut [u8]) -> PosixResult<usize> {
        check_path(path)?;
        if buf.is_empty() {
            return Err(Errno::raise(libc::EINVAL));
        }
        let (path, cwd) = (path.to_owned(), self.cwd());
        let target = self.call("readlink", move |engine| {
            async move { engine.readlink(&path, cwd).await }.boxed_local()
        })?;
        let n = target.len().min(buf.len());
        buf[..n].copy_from_slice(&target.as_bytes()[..n]);
        Ok(n)
    }

    // ---- file descriptors -----------------------------------------------

    pub fn open(&self, path: &str, flags: c_int, mode: u32) -> PosixResult<c_int> {
        check_path(path)?;
        let open_flags = abi::open_flags(flags).ok_or_else(|| Errno::raise(libc::EINVAL))?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let mode = mode & 0o7777;
        let opened = self.call("open", move |engine| {
            async move { engine.open(&path, cwd, open_flags, mode).await }.boxed_local()
        })?;
        match c_int::try_from(opened.0) {
            Ok(fd) => Ok(fd),
            Err(_) => {
                let _ = self.call("close", move |engine| engine.close(opened).boxed_local());
                Err(Errno::raise(libc::EMFILE))
            }
        }
    }

    pub fn close(&self, fd: c_int) -> PosixResult<()> {
        let fd = handle(fd)?;
        self.call("close", move |engine| engine.close(fd).boxed_local())
    }

    pub fn read(&self, fd: c_int, buf: &mut [u8]) -> PosixResult<usize> {
        let fd = handle(fd)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len();
        let data = self.call("read", move |engine| engine.read(fd, len).boxed_local())?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    pub fn write(&self, fd: c_int, buf: &[u8]) -> PosixResult<usize> {
        let fd = handle(fd)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let data = buf.to_vec();
        self.call("write", move |engine| {
            async move { engine.write(fd, &data).await }.boxed_local()
        })
    }

    pub fn pread(&self, fd: c_int, buf: &mut [u8], offset: i64) -> PosixResult<usize> {
        let fd = handle(fd)?;
        let offset = non_negative(offset)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len();
        let data = self.call("pread", move |engine| engine.pread(fd, offset, len).boxed_local())?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    pub fn pwrite(&self, fd: c_int, buf: &[u8], offset: i64) -> PosixResult<usize> {
        let fd = handle(fd)?;
        let offset = non_negative(offset)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let data = buf.to_vec();
        self.call("pwrite", move |engine| {
            async move { engine.pwrite(fd, offset, &data).await }.boxed_local()
        })
    }

    pub fn lseek(&self, fd: c_int, offset: i64, whence: c_int) -> PosixResult<i64> {
        let fd = handle(fd)?;
        let whence = abi::whence(whence).ok_or_else(|| Errno::raise(libc::EINVAL))?;
        let position = self.call("lseek", move |engine| engine.seek(fd, offset, whence).boxed_local())?;
        i64::try_from(position).map_err(|_| Errno::raise(libc::EOVERFLOW))
    }

    pub fn fsync(&self, fd: c_int) -> PosixResult<()> {
        let fd = handle(fd)?;
        self.call("fsync", move |engine| engine.fsync(fd).boxed_local())
    }

    /// Mode 0 only: grows the file to cover the range, zero-filled.
    pub fn fallocate(&self, fd: c_int, mode: c_int, offset: i64, len: i64) -> PosixResult<()> {
        let fd = handle(fd)?;
        if mode != 0 {
            return Err(Errno::raise(libc::EOPNOTSUPP));
        }
        if len <= 0 {
            return Err(Errno::raise(libc::EINVAL));
        }
        let end = non_negative(offset)?
            .checked_add(non_negative(len)?)
            .filter(|end| *end <= i64::MAX as u64)
            .ok_or_else(|| Errno::raise(libc::EFBIG))?;
        self.call("fallocate", move |engine| engine.allocate(fd, end).boxed_local())
    }

    /// Data and metadata are committed together, so this is `fsync`.
    pub fn fdatasync(&self, fd: c_int) -> PosixResult<()> {
        let fd = handle(fd)?;
        self.call("fdatasync", move |engine| engine.fsync(fd).boxed_local())
    }

    /// `F_GETFD`, `F_SETFD`, `F_GETFL` and `F_SETFL`. Descriptors are never
    /// inherited by an exec, so descriptor flags read as zero and setting
    /// them is accepted and ignored. `F_SETFL` changes only `O_APPEND`.
    pub fn fcntl(&self, fd: c_int, cmd: c_int, arg: c_int) -> PosixResult<c_int> {
        let fd = handle(fd)?;
        match cmd {
            libc::F_GETFD | libc::F_SETFD => {
                self.call("fcntl", move |engine| engine.handle_flags(fd).boxed_local())?;
                Ok(0)
            }
            libc::F_GETFL => {
                let flags = self.call("fcntl", move |engine| engine.handle_flags(fd).boxed_local())?;
                Ok(abi::status_flags(flags))
            }
            libc::F_SETFL => {
                let append = arg & libc::O_APPEND != 0;
                self.call("fcntl", move |engine| engine.set_append(fd, append).boxed_local())?;
                Ok(0)
            }
            _ => Err(Errno::raise(libc::EINVAL)),
        }
    }

    /// Fill `buf` with `linux_dirent64` records for the entries of the
    /// directory open at `fd`, continuing where the last call stopped.
    /// Returns the bytes used; zero at the end of the directory.
    pub fn getdents(&self, fd: c_int, buf: &mut [u8]) -> PosixResult<usize> {
        let fd = handle(fd)?;
        if buf.is_empty() {
            return Err(Errno::raise(libc::EINVAL));
        }
        let capacity = buf.len();
        let packed = self.call("getdents", move |engine| {
            async move {
                let start = engine.seek(fd, 0, Whence::Current).await?;
                let entries = engine.read_dir(fd).await?;
                let mut out = vec![0u8; capacity];
                let (used, count) = abi::pack_dirents(&entries, start, &mut out);
                let resume = i64::try_from(start + count as u64).map_err(|_| FsError::OutOfRange)?;
                engine.seek(fd, resume, Whence::Set).await?;
                if count == 0 && !entries.is_empty() {
                    return Err(FsError::InvalidArgument);
                }
                out.truncate(used);
                Ok(out)
            }
            .boxed_local()
        })?;
        buf[..packed.len()].copy_from_slice(&packed);
        Ok(packed.len())
    }

    // ---- working directory ----------------------------------------------

    pub fn chdir(&self, path: &str) -> PosixResult<()> {
        check_path(path)?;
        let (path, cwd) = (path.to_owned(), self.cwd());
        let dir = self.call("chdir", move |engine| {
            async move { engine.chdir(&path, cwd).await }.boxed_local()
        })?;
        cwd::set(self.bridge.id(), dir);
        Ok(())
    }

    pub fn fchdir(&self, fd: c_int) -> PosixResult<()> {
        let fd = handle(fd)?;
        let dir = self.call("fchdir", move |engine| engine.fchdir(fd).boxed_local())?;
        cwd::set(self.bridge.id(), dir);
        Ok(())
    }

    /// Write the NUL-terminated working directory into `buf`; returns its
    /// length including the terminator.
    pub fn getcwd(&self, buf: &mut [u8]) -> PosixResult<usize> {
        if buf.is_empty() {
            return Err(Errno::raise(libc::EINVAL));
        }
        let path = self.current_dir()?;
        let len = path.len() + 1;
        if len > buf.len() {
            return Err(Errno::from(&FsError::OutOfRange));
        }
        buf[..path.len()].copy_from_slice(path.as_bytes());
        buf[path.len()] = 0;
        Ok(len)
    }

    /// Absolute path of this thread's working directory.
    pub fn current_dir(&self) -> PosixResult<String> {
        let cwd = self.cwd();
        self.call("getcwd", move |engine| engine.path_of(cwd).boxed_local())
    }
}
