//! Typed requests and results.
//!
//! Every operation has its own parameter struct (`Open`, `Read`, ...) implementing
//! [`IoOperation`], which names the operation's success payload. A [`Request`] wraps the
//! parameters together with the result slot and an optional completion callback:
//!
//! ```no_run
//! use ioring::{IoRing, Read, Request};
//! # let fd = 0;
//!
//! let ring = IoRing::new(8, 16);
//! let request = Request::new(Read::new(fd, 6, vec![0u8; 5])).with_callback(|req| {
//!     match req.result() {
//!         Some(Ok(res)) => println!("read {} bytes", res.bytes_read),
//!         Some(Err(err)) => eprintln!("read failed: {err}"),
//!         None => unreachable!(),
//!     }
//! });
//! let handle = ring.queue_request(request);
//! ring.wait_for_request(handle, None);
//! ```
//!
//! Buffers are owned by the request while it is in flight and handed back to the callback,
//! which receives the finished request by value.

use crate::handle::RequestHandle;
use crate::{FileError, OpenMode, Operation};
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::SystemTime;

mod sealed {
    pub trait Sealed {}
}

/// Parameters of one kind of ring request
pub trait IoOperation: sealed::Sealed + Sized + Send + 'static {
    /// The operation tag
    const OPERATION: Operation;

    /// Payload delivered on success
    type Output: fmt::Debug + Send + 'static;

    #[doc(hidden)]
    fn into_any(request: Request<Self>) -> AnyRequest;
}

type Callback<Op> = Box<dyn FnOnce(Request<Op>) + Send + 'static>;

/// A request for one operation, its result slot, and its completion callback
pub struct Request<Op: IoOperation> {
    op: Op,
    result: Option<Result<Op::Output, FileError>>,
    callback: Option<Callback<Op>>,
}

impl<Op: IoOperation> Request<Op> {
    /// Wrap operation parameters into a request with no callback
    #[must_use]
    pub fn new(op: Op) -> Self {
        Self {
            op,
            result: None,
            callback: None,
        }
    }

    /// Builder form of [`Request::set_callback`]
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Request<Op>) + Send + 'static,
    {
        self.set_callback(callback);
        self
    }

    /// Install the callback invoked once the request has completed or failed.
    ///
    /// The callback runs on whichever thread drains the ring. It must not block on the
    /// ring it was queued on.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnOnce(Request<Op>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Remove any installed callback
    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Whether a callback is installed
    #[must_use]
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// The operation this request performs
    #[must_use]
    pub fn operation(&self) -> Operation {
        Op::OPERATION
    }

    /// Operation parameters
    #[must_use]
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Mutable operation parameters
    pub fn op_mut(&mut self) -> &mut Op {
        &mut self.op
    }

    /// Consume the request, returning its parameters (and any buffers they own)
    #[must_use]
    pub fn into_op(self) -> Op {
        self.op
    }

    /// The outcome, or `None` while the request has not completed
    #[must_use]
    pub fn result(&self) -> Option<&Result<Op::Output, FileError>> {
        self.result.as_ref()
    }

    /// Take the outcome out of the request
    pub fn take_result(&mut self) -> Option<Result<Op::Output, FileError>> {
        self.result.take()
    }

    /// Consume the request, returning its parameters and outcome
    #[must_use]
    pub fn into_parts(self) -> (Op, Option<Result<Op::Output, FileError>>) {
        (self.op, self.result)
    }

    pub(crate) fn set_result(&mut self, result: Result<Op::Output, FileError>) {
        self.result = Some(result);
    }

    pub(crate) fn fail(&mut self, error: FileError) {
        self.result = Some(Err(error));
    }

    /// Hand the request to its callback, if there is one
    pub(crate) fn finish(mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

impl<Op> fmt::Debug for Request<Op>
where
    Op: IoOperation + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("op", &self.op)
            .field("result", &self.result)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// ============================================================================
// Operation parameters
// ============================================================================

/// Open a file by path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    /// Path to open, relative paths resolve against the current directory
    pub path: PathBuf,
    /// Access and creation mode
    pub mode: OpenMode,
}

impl Open {
    /// Open `path` with `mode`
    pub fn new(path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }
}

/// Close a file descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close {
    /// Descriptor to close
    pub fd: RawFd,
}

impl Close {
    /// Close `fd`
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

/// Read into `destination` starting at `offset`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    /// Descriptor to read from
    pub fd: RawFd,
    /// Byte offset in the file
    pub offset: u64,
    /// Buffer to fill; its length bounds the transfer
    pub destination: Vec<u8>,
}

impl Read {
    /// Read up to `destination.len()` bytes at `offset`
    pub fn new(fd: RawFd, offset: u64, destination: Vec<u8>) -> Self {
        Self {
            fd,
            offset,
            destination,
        }
    }
}

/// Write `source` starting at `offset`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    /// Descriptor to write to
    pub fd: RawFd,
    /// Byte offset in the file
    pub offset: u64,
    /// Bytes to write
    pub source: Vec<u8>,
}

impl Write {
    /// Write all of `source` at `offset`
    pub fn new(fd: RawFd, offset: u64, source: Vec<u8>) -> Self {
        Self { fd, offset, source }
    }
}

/// Read into several buffers, in order, starting at `offset`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectoredRead {
    /// Descriptor to read from
    pub fd: RawFd,
    /// Byte offset in the file
    pub offset: u64,
    /// Buffers filled one after another
    pub destinations: Vec<Vec<u8>>,
}

impl VectoredRead {
    /// Scatter a read at `offset` over `destinations`
    pub fn new(fd: RawFd, offset: u64, destinations: Vec<Vec<u8>>) -> Self {
        Self {
            fd,
            offset,
            destinations,
        }
    }
}

/// Write several buffers, in order, starting at `offset`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectoredWrite {
    /// Descriptor to write to
    pub fd: RawFd,
    /// Byte offset in the file
    pub offset: u64,
    /// Buffers written one after another
    pub sources: Vec<Vec<u8>>,
}

impl VectoredWrite {
    /// Gather `sources` into one write at `offset`
    pub fn new(fd: RawFd, offset: u64, sources: Vec<Vec<u8>>) -> Self {
        Self {
            fd,
            offset,
            sources,
        }
    }
}

/// Flush data and metadata of a file to storage (fsync)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flush {
    /// Descriptor to flush
    pub fd: RawFd,
}

impl Flush {
    /// Flush `fd`
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

/// Query metadata of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Descriptor to query
    pub fd: RawFd,
}

impl Stat {
    /// Stat `fd`
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

/// Cancel another request queued on the same ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancel {
    /// Request to cancel
    pub target: RequestHandle,
}

impl Cancel {
    /// Cancel `target`
    pub fn new(target: RequestHandle) -> Self {
        Self { target }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Result of a successful [`Open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResult {
    /// The new descriptor; the caller owns it
    pub fd: RawFd,
}

/// Result of a successful [`Read`] or [`VectoredRead`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    /// Bytes read; fewer than requested only at end of file
    pub bytes_read: u64,
}

/// Result of a successful [`Write`] or [`VectoredWrite`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Bytes written
    pub bytes_written: u64,
}

/// Result of a successful [`Stat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatResult {
    /// File size in bytes
    pub size: u64,
    /// File type and permission bits (`st_mode`)
    pub mode: u32,
    /// Last modification time, when the platform reports one
    pub modified: Option<SystemTime>,
}

impl StatResult {
    /// Whether the file is a directory
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// Whether the file is a regular file
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
    }
}

/// What a [`Cancel`] request achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The target was stopped and completes with [`FileError::Aborted`]
    Cancelled,
    /// The target had already completed, or the handle never named a request
    NotFound,
    /// The target was already executing and may still complete normally
    InProgress,
}

// ============================================================================
// Type-erased storage
// ============================================================================

/// A request of any operation, as stored by the ring
#[doc(hidden)]
pub enum AnyRequest {
    Open(Request<Open>),
    Close(Request<Close>),
    Read(Request<Read>),
    Write(Request<Write>),
    VectoredRead(Request<VectoredRead>),
    VectoredWrite(Request<VectoredWrite>),
    Flush(Request<Flush>),
    Stat(Request<Stat>),
    Cancel(Request<Cancel>),
}

macro_rules! impl_operation {
    ($($op:ident => $output:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $op {}

            impl IoOperation for $op {
                const OPERATION: Operation = Operation::$op;
                type Output = $output;

                fn into_any(request: Request<Self>) -> AnyRequest {
                    AnyRequest::$op(request)
                }
            }
        )*

        impl AnyRequest {
            pub(crate) fn operation(&self) -> Operation {
                match self {
                    $(AnyRequest::$op(_) => Operation::$op,)*
                }
            }

            /// Record `error` as the outcome
            pub(crate) fn fail(&mut self, error: FileError) {
                match self {
                    $(AnyRequest::$op(req) => req.fail(error),)*
                }
            }

            /// Hand the request to its callback
            pub(crate) fn finish(self) {
                match self {
                    $(AnyRequest::$op(req) => req.finish(),)*
                }
            }
        }
    };
}

impl_operation! {
    Open => OpenResult,
    Close => (),
    Read => ReadResult,
    Write => WriteResult,
    VectoredRead => ReadResult,
    VectoredWrite => WriteResult,
    Flush => (),
    Stat => StatResult,
    Cancel => CancelStatus,
}

impl fmt::Debug for AnyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyRequest::Open(req) => write!(f, "open {}", req.op.path.display()),
            AnyRequest::Close(req) => write!(f, "close fd {}", req.op.fd),
            AnyRequest::Read(req) => write!(
                f,
                "read fd {} offset {} len {}",
                req.op.fd,
                req.op.offset,
                req.op.destination.len()
            ),
            AnyRequest::Write(req) => write!(
                f,
                "write fd {} offset {} len {}",
                req.op.fd,
                req.op.offset,
                req.op.source.len()
            ),
            AnyRequest::VectoredRead(req) => write!(
                f,
                "readv fd {} offset {} buffers {}",
                req.op.fd,
                req.op.offset,
                req.op.destinations.len()
            ),
            AnyRequest::VectoredWrite(req) => write!(
                f,
                "writev fd {} offset {} buffers {}",
                req.op.fd,
                req.op.offset,
                req.op.sources.len()
            ),
            AnyRequest::Flush(req) => write!(f, "flush fd {}", req.op.fd),
            AnyRequest::Stat(req) => write!(f, "stat fd {}", req.op.fd),
            AnyRequest::Cancel(req) => write!(f, "cancel {:?}", req.op.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_request_has_no_result() {
        let request = Request::new(Read::new(3, 0, vec![0u8; 16]));
        assert!(request.result().is_none());
        assert!(!request.has_callback());
        assert_eq!(request.operation(), Operation::Read);
        assert_eq!(request.op().destination.len(), 16);
    }

    #[test]
    fn test_finish_invokes_callback_with_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut request = Request::new(Write::new(4, 0, b"abc".to_vec())).with_callback(move |req| {
            let written = req.result().unwrap().as_ref().unwrap().bytes_written;
            assert_eq!(written, 3);
            assert_eq!(req.op().source, b"abc");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        request.set_result(Ok(WriteResult { bytes_written: 3 }));
        request.finish();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_any_request_fail_and_finish() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let request = Request::new(Open::new("/nonexistent", OpenMode::READ_ONLY)).with_callback(
            move |req| {
                assert_eq!(req.result(), Some(&Err(FileError::NotFound)));
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );

        let mut any = Open::into_any(request);
        assert_eq!(any.operation(), Operation::Open);
        any.fail(FileError::NotFound);
        any.finish();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finish_without_callback_is_silent() {
        let mut request = Request::new(Flush::new(5));
        request.set_result(Ok(()));
        request.finish();
    }

    #[test]
    fn test_into_parts_returns_buffers() {
        let mut request = Request::new(VectoredRead::new(3, 0, vec![vec![1], vec![2, 3]]));
        request.set_result(Ok(ReadResult { bytes_read: 3 }));

        let (op, result) = request.into_parts();
        assert_eq!(op.destinations, vec![vec![1], vec![2, 3]]);
        assert_eq!(result, Some(Ok(ReadResult { bytes_read: 3 })));
    }

    #[test]
    fn test_stat_result_file_type() {
        let stat = StatResult {
            size: 11,
            mode: libc::S_IFREG as u32 | 0o644,
            modified: None,
        };
        assert!(stat.is_file());
        assert!(!stat.is_dir());
    }
}
