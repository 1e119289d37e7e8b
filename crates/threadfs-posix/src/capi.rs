// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `extern "C"` entry points over the process-wide adapter.
//!
//! Every function returns what its libc namesake returns and leaves the
//! error in [`threadfs_errno`]. Pointer arguments must be null or valid for
//! the access the libc function would make; null pointers fail with
//! `EINVAL`. Until [`install`] has been called every call fails with `EIO`.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_void, CStr};

use libc::{c_char, c_int, dev_t, gid_t, mode_t, off_t, size_t, ssize_t, uid_t};
use once_cell::sync::OnceCell;
use tracing::info;

use crate::abi::{Stat, Statfs, UtimBuf};
use crate::adapter::Posix;
use crate::errno::{self, Errno, PosixResult};

static ADAPTER: OnceCell<Posix> = OnceCell::new();

/// Make `posix` the adapter behind the C entry points. Fails, handing it
/// back, if one is already installed.
pub fn install(posix: Posix) -> Result<(), Posix> {
    ADAPTER.set(posix)?;
    info!(target: "threadfs::posix", "C entry points installed");
    Ok(())
}

pub fn installed() -> Option<&'static Posix> {
    ADAPTER.get()
}

fn with_adapter<T>(f: impl FnOnce(&Posix) -> PosixResult<T>) -> PosixResult<T> {
    match ADAPTER.get() {
        Some(posix) => f(posix),
        None => Err(Errno::raise(libc::EIO)),
    }
}

unsafe fn path_arg<'a>(ptr: *const c_char) -> PosixResult<&'a str> {
    if ptr.is_null() {
        return Err(Errno::raise(libc::EINVAL));
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().map_err(|_| Errno::raise(libc::EINVAL))
}

unsafe fn buf_mut<'a>(ptr: *mut c_void, len: size_t) -> PosixResult<&'a mut [u8]> {
    if ptr.is_null() {
        return Err(Errno::raise(libc::EINVAL));
    }
    Ok(unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), len) })
}

unsafe fn buf_ref<'a>(ptr: *const c_void, len: size_t) -> PosixResult<&'a [u8]> {
    if ptr.is_null() {
        return Err(Errno::raise(libc::EINVAL));
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) })
}

unsafe fn out_arg<'a, T>(ptr: *mut T) -> PosixResult<&'a mut T> {
    unsafe { ptr.as_mut() }.ok_or_else(|| Errno::raise(libc::EINVAL))
}

fn status(result: PosixResult<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn byte_count(result: PosixResult<usize>) -> ssize_t {
    match result {
        Ok(n) => ssize_t::try_from(n).unwrap_or(ssize_t::MAX),
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn threadfs_errno() -> c_int {
    errno::errno()
}

/// Commit pending writes and stop the storage thread.
#[no_mangle]
pub extern "C" fn threadfs_shutdown() -> c_int {
    status(with_adapter(|posix| {
        posix.bridge().shutdown().map_err(|err| Errno::from(&err))
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_stat(path: *const c_char, buf: *mut Stat) -> c_int {
    status(with_adapter(|posix| {
        let path = unsafe { path_arg(path) }?;
        let out = unsafe { out_arg(buf) }?;
        *out = posix.stat(path)?;
        Ok(())
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_lstat(path: *const c_char, buf: *mut Stat) -> c_int {
    status(with_adapter(|posix| {
        let path = unsafe { path_arg(path) }?;
        let out = unsafe { out_arg(buf) }?;
        *out = posix.lstat(path)?;
        Ok(())
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_fstat(fd: c_int, buf: *mut Stat) -> c_int {
    status(with_adapter(|posix| {
        let out = unsafe { out_arg(buf) }?;
        *out = posix.fstat(fd)?;
        Ok(())
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_mkdir(path: *const c_char, mode: mode_t) -> c_int {
    status(with_adapter(|posix| posix.mkdir(unsafe { path_arg(path) }?, u32::from(mode))))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_rmdir(path: *const c_char) -> c_int {
    status(with_adapter(|posix| posix.rmdir(unsafe { path_arg(path) }?)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_unlink(path: *const c_char) -> c_int {
    status(with_adapter(|posix| posix.unlink(unsafe { path_arg(path) }?)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_rename(from: *const c_char, to: *const c_char) -> c_int {
    status(with_adapter(|posix| {
        posix.rename(unsafe { path_arg(from) }?, unsafe { path_arg(to) }?)
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_symlink(target: *const c_char, link: *const c_char) -> c_int {
    status(with_adapter(|posix| {
        posix.symlink(unsafe { path_arg(target) }?, unsafe { path_arg(link) }?)
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_mknod(path: *const c_char, mode: mode_t, dev: dev_t) -> c_int {
    status(with_adapter(|posix| posix.mknod(unsafe { path_arg(path) }?, u32::from(mode), dev)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_readlink(
    path: *const c_char,
    buf: *mut c_char,
    bufsize: size_t,
) -> ssize_t {
    byte_count(with_adapter(|posix| {
        let path = unsafe { path_arg(path) }?;
        let buf = unsafe { buf_mut(buf.cast(), bufsize) }?;
        posix.readlink(path, buf)
    }))
}

/// A null `times` sets both times to now.
#[no_mangle]
pub unsafe extern "C" fn threadfs_utime(path: *const c_char, times: *const UtimBuf) -> c_int {
    status(with_adapter(|posix| {
        let path = unsafe { path_arg(path) }?;
        posix.utime(path, unsafe { times.as_ref() })
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_chmod(path: *const c_char, mode: mode_t) -> c_int {
    status(with_adapter(|posix| posix.chmod(unsafe { path_arg(path) }?, u32::from(mode))))
}

#[no_mangle]
pub extern "C" fn threadfs_fchmod(fd: c_int, mode: mode_t) -> c_int {
    status(with_adapter(|posix| posix.fchmod(fd, u32::from(mode))))
}

/// `(uid_t)-1` or `(gid_t)-1` leaves that id unchanged.
#[no_mangle]
pub unsafe extern "C" fn threadfs_chown(path: *const c_char, uid: uid_t, gid: gid_t) -> c_int {
    status(with_adapter(|posix| posix.chown(unsafe { path_arg(path) }?, uid, gid)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_lchown(path: *const c_char, uid: uid_t, gid: gid_t) -> c_int {
    status(with_adapter(|posix| posix.lchown(unsafe { path_arg(path) }?, uid, gid)))
}

#[no_mangle]
pub extern "C" fn threadfs_fchown(fd: c_int, uid: uid_t, gid: gid_t) -> c_int {
    status(with_adapter(|posix| posix.fchown(fd, uid, gid)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_statfs(path: *const c_char, buf: *mut Statfs) -> c_int {
    status(with_adapter(|posix| {
        let path = unsafe { path_arg(path) }?;
        let out = unsafe { out_arg(buf) }?;
        *out = posix.statfs(path)?;
        Ok(())
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_fstatfs(fd: c_int, buf: *mut Statfs) -> c_int {
    status(with_adapter(|posix| {
        let out = unsafe { out_arg(buf) }?;
        *out = posix.fstatfs(fd)?;
        Ok(())
    }))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_access(path: *const c_char, mode: c_int) -> c_int {
    status(with_adapter(|posix| posix.access(unsafe { path_arg(path) }?, mode)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_truncate(path: *const c_char, length: off_t) -> c_int {
    status(with_adapter(|posix| posix.truncate(unsafe { path_arg(path) }?, length)))
}

#[no_mangle]
pub extern "C" fn threadfs_ftruncate(fd: c_int, length: off_t) -> c_int {
    status(with_adapter(|posix| posix.ftruncate(fd, length)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    match with_adapter(|posix| posix.open(unsafe { path_arg(path) }?, flags, u32::from(mode))) {
        Ok(fd) => fd,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn threadfs_close(fd: c_int) -> c_int {
    status(with_adapter(|posix| posix.close(fd)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    byte_count(with_adapter(|posix| posix.read(fd, unsafe { buf_mut(buf, count) }?)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    byte_count(with_adapter(|posix| posix.write(fd, unsafe { buf_ref(buf, count) }?)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_pread(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    offset: off_t,
) -> ssize_t {
    byte_count(with_adapter(|posix| posix.pread(fd, unsafe { buf_mut(buf, count) }?, offset)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_pwrite(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    offset: off_t,
) -> ssize_t {
    byte_count(with_adapter(|posix| posix.pwrite(fd, unsafe { buf_ref(buf, count) }?, offset)))
}

#[no_mangle]
pub extern "C" fn threadfs_lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    with_adapter(|posix| posix.lseek(fd, offset, whence)).unwrap_or(-1)
}

#[no_mangle]
pub extern "C" fn threadfs_fsync(fd: c_int) -> c_int {
    status(with_adapter(|posix| posix.fsync(fd)))
}

#[no_mangle]
pub extern "C" fn threadfs_fallocate(fd: c_int, mode: c_int, offset: off_t, len: off_t) -> c_int {
    status(with_adapter(|posix| posix.fallocate(fd, mode, offset, len)))
}

#[no_mangle]
pub extern "C" fn threadfs_fdatasync(fd: c_int) -> c_int {
    status(with_adapter(|posix| posix.fdatasync(fd)))
}

/// Takes the integer argument form only, which covers every command served.
#[no_mangle]
pub extern "C" fn threadfs_fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    with_adapter(|posix| posix.fcntl(fd, cmd, arg)).unwrap_or(-1)
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_getdents(fd: c_int, dirp: *mut c_void, count: size_t) -> ssize_t {
    byte_count(with_adapter(|posix| posix.getdents(fd, unsafe { buf_mut(dirp, count) }?)))
}

#[no_mangle]
pub unsafe extern "C" fn threadfs_chdir(path: *const c_char) -> c_int {
    status(with_adapter(|posix| posix.chdir(unsafe { path_arg(path) }?)))
}

#[no_mangle]
pub extern "C" fn threadfs_fchdir(fd: c_int) -> c_int {
    status(with_adapter(|posix| posix.fchdir(fd)))
}

/// Returns `buf`, or null on failure.
#[no_mangle]
pub unsafe extern "C" fn threadfs_getcwd(buf: *mut c_char, size: size_t) -> *mut c_char {
    let result = with_adapter(|posix| posix.getcwd(unsafe { buf_mut(buf.cast(), size) }?));
    match result {
        Ok(_) => buf,
        Err(_) => std::ptr::null_mut(),
    }
}
