//! Operation kinds and open-mode flags.

use bitflags::bitflags;
use std::fmt;

/// The kinds of request an [`IoRing`](crate::IoRing) accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    /// Open a file by path
    Open,
    /// Close a file descriptor
    Close,
    /// Positioned read into one buffer
    Read,
    /// Positioned write from one buffer
    Write,
    /// Positioned read scattered over several buffers
    VectoredRead,
    /// Positioned write gathered from several buffers
    VectoredWrite,
    /// Flush file data and metadata to storage
    Flush,
    /// Query file metadata
    Stat,
    /// Cancel another request
    Cancel,
}

impl Operation {
    /// Every operation, in declaration order
    pub const ALL: [Operation; 9] = [
        Operation::Open,
        Operation::Close,
        Operation::Read,
        Operation::Write,
        Operation::VectoredRead,
        Operation::VectoredWrite,
        Operation::Flush,
        Operation::Stat,
        Operation::Cancel,
    ];

    /// Short lowercase name, used in logs and the CLI
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Close => "close",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::VectoredRead => "readv",
            Operation::VectoredWrite => "writev",
            Operation::Flush => "flush",
            Operation::Stat => "stat",
            Operation::Cancel => "cancel",
        }
    }

    /// Whether completion of this operation must wait for everything submitted before it
    #[must_use]
    pub const fn is_barrier(self) -> bool {
        matches!(self, Operation::Close | Operation::Flush)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// How a file is opened by an [`Open`](crate::Open) request.
    ///
    /// Write access creates the file unless [`OpenMode::EXISTING_ONLY`] is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        /// Open for reading
        const READ_ONLY = 0x0001;
        /// Open for writing
        const WRITE_ONLY = 0x0002;
        /// Open for reading and writing
        const READ_WRITE = Self::READ_ONLY.bits() | Self::WRITE_ONLY.bits();
        /// Every write goes to the end of the file
        const APPEND = 0x0004;
        /// Truncate an existing file to zero length
        const TRUNCATE = 0x0008;
        /// Fail unless the file already exists
        const EXISTING_ONLY = 0x0080;
        /// Fail if the file already exists
        const NEW_ONLY = 0x0040;
    }
}

impl OpenMode {
    /// Translate to `open(2)` flags. Descriptors are always opened close-on-exec.
    #[must_use]
    pub fn to_open_flags(self) -> i32 {
        let mut flags = if self.contains(OpenMode::READ_WRITE) {
            libc::O_RDWR
        } else if self.contains(OpenMode::WRITE_ONLY) {
            libc::O_WRONLY
        } else {
            libc::O_RDONLY
        };

        if self.contains(OpenMode::WRITE_ONLY) && !self.contains(OpenMode::EXISTING_ONLY) {
            flags |= libc::O_CREAT;
        }
        if self.contains(OpenMode::TRUNCATE) {
            flags |= libc::O_TRUNC;
        }
        if self.contains(OpenMode::APPEND) {
            flags |= libc::O_APPEND;
        }
        if self.contains(OpenMode::NEW_ONLY) {
            flags |= libc::O_EXCL | libc::O_CREAT;
        }
        flags | libc::O_CLOEXEC
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::READ_ONLY
    }
}
