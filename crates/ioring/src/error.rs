//! Error types for the I/O ring.
//!
//! Two families exist. [`RingError`] describes why a ring could not be brought up; it never
//! crosses the public request API and is only logged and folded into the `bool` returned by
//! [`IoRing::ensure_initialized`](crate::IoRing::ensure_initialized). [`FileError`] is the
//! per-request failure delivered through a request's result.

use crate::Operation;
use std::io;
use thiserror::Error;

/// Failure of an individual request.
///
/// One variant per recoverable OS condition the ring maps `errno` values into, plus
/// [`FileError::Unknown`] carrying the raw code for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FileError {
    /// No such file or directory (`ENOENT`)
    #[error("no such file or directory")]
    NotFound,

    /// Permission denied (`EACCES`, `EPERM`, `EROFS`)
    #[error("permission denied")]
    PermissionDenied,

    /// File already exists (`EEXIST`)
    #[error("file already exists")]
    AlreadyExists,

    /// Invalid or closed file descriptor (`EBADF`)
    #[error("bad file descriptor")]
    BadDescriptor,

    /// Invalid argument (`EINVAL`, interior NUL in a path, too many buffers)
    #[error("invalid argument")]
    InvalidArgument,

    /// Target is a directory (`EISDIR`)
    #[error("is a directory")]
    IsDirectory,

    /// A path component is not a directory (`ENOTDIR`)
    #[error("not a directory")]
    NotADirectory,

    /// No space left on device (`ENOSPC`, `EDQUOT`)
    #[error("no space left on device")]
    NoSpace,

    /// Per-process or system-wide descriptor limit reached (`EMFILE`, `ENFILE`)
    #[error("too many open files")]
    TooManyOpenFiles,

    /// File too large for the filesystem (`EFBIG`, `EOVERFLOW`)
    #[error("file too large")]
    FileTooLarge,

    /// Low-level device I/O error (`EIO`)
    #[error("input/output error")]
    Io,

    /// Operation not supported by the file or the backend (`EOPNOTSUPP`, `ENOSYS`)
    #[error("operation not supported")]
    Unsupported,

    /// Resources exhausted, or the ring itself is unusable (`ENOMEM`, `EAGAIN`)
    #[error("resource error")]
    Resource,

    /// Request was cancelled before it completed (`ECANCELED`)
    #[error("operation aborted")]
    Aborted,

    /// Transfer exceeds the largest size the kernel moves in one call
    #[error("transfer of {requested} bytes exceeds the per-call limit of {limit} bytes")]
    TransferTooLarge {
        /// Bytes requested
        requested: u64,
        /// Largest permitted transfer
        limit: u64,
    },

    /// Any other OS error
    #[error("unknown error (errno {0})")]
    Unknown(i32),
}

impl FileError {
    /// Map a positive `errno` value to a [`FileError`].
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Self::NotFound,
            libc::EACCES | libc::EPERM | libc::EROFS => Self::PermissionDenied,
            libc::EEXIST => Self::AlreadyExists,
            libc::EBADF => Self::BadDescriptor,
            libc::EINVAL => Self::InvalidArgument,
            libc::EISDIR => Self::IsDirectory,
            libc::ENOTDIR => Self::NotADirectory,
            libc::ENOSPC | libc::EDQUOT => Self::NoSpace,
            libc::EMFILE | libc::ENFILE => Self::TooManyOpenFiles,
            libc::EFBIG | libc::EOVERFLOW => Self::FileTooLarge,
            libc::EIO => Self::Io,
            libc::EOPNOTSUPP | libc::ENOSYS => Self::Unsupported,
            libc::ENOMEM | libc::EAGAIN => Self::Resource,
            libc::ECANCELED => Self::Aborted,
            other => Self::Unknown(other),
        }
    }

    /// Map a kernel completion result (a negated `errno`) to a [`FileError`].
    #[must_use]
    pub fn from_completion(res: i32) -> Self {
        Self::from_errno(res.saturating_neg())
    }

    /// The `errno` value this error most closely corresponds to.
    #[must_use]
    pub fn raw_os_error(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::AlreadyExists => libc::EEXIST,
            Self::BadDescriptor => libc::EBADF,
            Self::InvalidArgument => libc::EINVAL,
            Self::IsDirectory => libc::EISDIR,
            Self::NotADirectory => libc::ENOTDIR,
            Self::NoSpace => libc::ENOSPC,
            Self::TooManyOpenFiles => libc::EMFILE,
            Self::FileTooLarge | Self::TransferTooLarge { .. } => libc::EFBIG,
            Self::Io => libc::EIO,
            Self::Unsupported => libc::EOPNOTSUPP,
            Self::Resource => libc::ENOMEM,
            Self::Aborted => libc::ECANCELED,
            Self::Unknown(errno) => *errno,
        }
    }
}

impl From<io::Error> for FileError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => match err.kind() {
                io::ErrorKind::NotFound => Self::NotFound,
                io::ErrorKind::PermissionDenied => Self::PermissionDenied,
                io::ErrorKind::AlreadyExists => Self::AlreadyExists,
                io::ErrorKind::InvalidInput => Self::InvalidArgument,
                io::ErrorKind::Unsupported => Self::Unsupported,
                io::ErrorKind::OutOfMemory => Self::Resource,
                _ => Self::Io,
            },
        }
    }
}

impl From<FileError> for io::Error {
    fn from(err: FileError) -> Self {
        io::Error::from_raw_os_error(err.raw_os_error())
    }
}

/// Errors raised while bringing up a ring backend
#[derive(Debug, Error)]
pub enum RingError {
    /// Kernel ring setup failed
    #[error("failed to set up io_uring: {0}")]
    Setup(#[source] io::Error),

    /// Completion notifier (eventfd) creation or registration failed
    #[error("failed to create completion notifier: {0}")]
    Notifier(#[source] io::Error),

    /// Probing kernel opcode support failed
    #[error("failed to probe io_uring opcodes: {0}")]
    Probe(#[source] io::Error),

    /// Kernel lacks an operation every backend must provide
    #[error("unsupported operation: {0:?}")]
    UnsupportedOperation(Operation),

    /// Requested backend does not exist on this platform
    #[error("backend {0} is not available on this platform")]
    Unavailable(&'static str),

    /// Configuration rejected before touching the kernel
    #[error("invalid ring configuration: {0}")]
    InvalidConfig(String),
}
