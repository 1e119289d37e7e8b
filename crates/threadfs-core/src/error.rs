// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for threadfs core

use crate::storage::BackendError;

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("too many levels of symbolic links")]
    TooManySymlinks,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("result out of range")]
    OutOfRange,
    #[error("backend failure: {0}")]
    BackendFailure(String),
}

impl From<BackendError> for FsError {
    fn from(err: BackendError) -> Self {
        FsError::BackendFailure(err.to_string())
    }
}

pub type FsResult<T> = Result<T, FsError>;
