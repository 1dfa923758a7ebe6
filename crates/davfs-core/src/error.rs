// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for davfs core

use std::io;

use davfs_proto::ProtoError;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("already exists")]
    Exists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("read-only file system")]
    ReadOnly,
    #[error("file too large")]
    FileTooLarge,
    #[error("busy")]
    Busy,
    #[error("stale identity")]
    StaleIdentity,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name too long")]
    NameTooLong,
    #[error("node is not open")]
    NotOpen,
    #[error("unsupported")]
    Unsupported,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("transport failure: {0}")]
    Transport(io::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// POSIX errno reported to the host for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied => libc::EACCES,
            FsError::Exists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::ReadOnly => libc::EROFS,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::Busy => libc::EBUSY,
            FsError::StaleIdentity => libc::ESTALE,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotOpen => libc::EBADF,
            FsError::Unsupported => libc::ENOTSUP,
            FsError::Protocol(_) | FsError::Transport(_) => libc::EIO,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Map a daemon result code onto an error. Unknown codes become `Io`.
    pub fn from_result_code(code: i32) -> Self {
        match code {
            libc::ENOENT => FsError::NotFound,
            libc::EACCES | libc::EPERM => FsError::AccessDenied,
            libc::EEXIST => FsError::Exists,
            libc::ENOTDIR => FsError::NotADirectory,
            libc::EISDIR => FsError::IsADirectory,
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::EROFS => FsError::ReadOnly,
            libc::EFBIG => FsError::FileTooLarge,
            libc::EBUSY => FsError::Busy,
            libc::ESTALE => FsError::StaleIdentity,
            libc::EINVAL => FsError::InvalidArgument,
            libc::ENAMETOOLONG => FsError::NameTooLong,
            libc::EBADF => FsError::NotOpen,
            code if code == libc::ENOTSUP || code == libc::EOPNOTSUPP => FsError::Unsupported,
            code => FsError::Io(io::Error::from_raw_os_error(code)),
        }
    }

    pub(crate) fn download_failed(path: &str) -> Self {
        FsError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("download of {} failed", path),
        ))
    }
}

impl From<ProtoError> for FsError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Io(err) => FsError::Transport(err),
            ProtoError::Closed => FsError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed the control channel",
            )),
            other => FsError::Protocol(other.to_string()),
        }
    }
}
