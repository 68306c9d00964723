//! POSIX-style error codes returned across the router boundary.
//!
//! Every filesystem operation resolves to either a value or one `Errno`.
//! Sub-request failures are folded by the aggregator before they get here,
//! so callers never see which node or which internal step produced a code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM,
    #[error("no such file or directory")]
    ENOENT,
    #[error("input/output error")]
    EIO,
    #[error("bad file descriptor")]
    EBADF,
    #[error("resource temporarily unavailable")]
    EAGAIN,
    #[error("permission denied")]
    EACCES,
    #[error("file exists")]
    EEXIST,
    #[error("invalid cross-device link")]
    EXDEV,
    #[error("not a directory")]
    ENOTDIR,
    #[error("is a directory")]
    EISDIR,
    #[error("invalid argument")]
    EINVAL,
    #[error("file too large")]
    EFBIG,
    #[error("no space left on device")]
    ENOSPC,
    #[error("directory not empty")]
    ENOTEMPTY,
    #[error("no data available")]
    ENODATA,
    #[error("operation not supported")]
    ENOTSUP,
    #[error("transport endpoint is not connected")]
    ENOTCONN,
    #[error("connection timed out")]
    ETIMEDOUT,
    #[error("stale file handle")]
    ESTALE,
}

impl Errno {
    /// Numeric errno as defined on Linux.
    pub fn code(&self) -> i32 {
        match self {
            Errno::EPERM => 1,
            Errno::ENOENT => 2,
            Errno::EIO => 5,
            Errno::EBADF => 9,
            Errno::EAGAIN => 11,
            Errno::EACCES => 13,
            Errno::EEXIST => 17,
            Errno::EXDEV => 18,
            Errno::ENOTDIR => 20,
            Errno::EISDIR => 21,
            Errno::EINVAL => 22,
            Errno::EFBIG => 27,
            Errno::ENOSPC => 28,
            Errno::ENOTEMPTY => 39,
            Errno::ENODATA => 61,
            Errno::ENOTSUP => 95,
            Errno::ENOTCONN => 107,
            Errno::ETIMEDOUT => 110,
            Errno::ESTALE => 116,
        }
    }

    /// Object-absent errors are tolerated by fan-out operations.
    pub fn is_absent(&self) -> bool {
        matches!(self, Errno::ENOENT | Errno::ESTALE)
    }

    /// Errors the transport reports when a node could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Errno::ENOTCONN | Errno::ETIMEDOUT)
    }
}

pub type FopResult<T> = Result<T, Errno>;
