// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! POSIX-style synchronous filesystem calls for worker threads.
//!
//! [`Posix`] wraps a [`threadfs_core::Bridge`]: each call validates its
//! arguments, runs one operation on the storage thread, and reports failure
//! through the calling thread's errno as well as its return value. The
//! [`capi`] module exposes the same calls with C linkage.

pub mod abi;
pub mod adapter;
pub mod capi;
pub mod cwd;
pub mod errno;

pub use abi::{Stat, Statfs, UtimBuf};
pub use adapter::{Posix, UNCHANGED_ID};
pub use errno::{errno, errno_for, set_errno, Errno, PosixResult};
