// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-thread errno and the `FsError` to errno mapping

use std::cell::Cell;
use std::fmt;

use libc::c_int;
use threadfs_core::FsError;

thread_local! {
    static ERRNO: Cell<c_int> = const { Cell::new(0) };
}

/// Last error set on this thread by a failing call. Successful calls leave it
/// untouched, as libc does.
pub fn errno() -> c_int {
    ERRNO.with(Cell::get)
}

pub fn set_errno(value: c_int) {
    ERRNO.with(|errno| errno.set(value));
}

/// A failed call's errno value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Errno(pub c_int);

impl Errno {
    /// Record `code` as this thread's errno and return it.
    pub fn raise(code: c_int) -> Self {
        set_errno(code);
        Errno(code)
    }
}

impl From<&FsError> for Errno {
    fn from(err: &FsError) -> Self {
        Errno::raise(errno_for(err))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", std::io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl std::error::Error for Errno {}

pub type PosixResult<T> = Result<T, Errno>;

pub fn errno_for(err: &FsError) -> c_int {
    match err {
        FsError::NotFound => libc::ENOENT,
        FsError::AlreadyExists => libc::EEXIST,
        FsError::NotADirectory => libc::ENOTDIR,
        FsError::IsADirectory => libc::EISDIR,
        FsError::NotEmpty => libc::ENOTEMPTY,
        FsError::TooManySymlinks => libc::ELOOP,
        FsError::PermissionDenied => libc::EACCES,
        FsError::InvalidArgument => libc::EINVAL,
        FsError::BadFileDescriptor => libc::EBADF,
        FsError::OutOfRange => libc::ERANGE,
        FsError::BackendFailure(_) => libc::EIO,
    }
}
