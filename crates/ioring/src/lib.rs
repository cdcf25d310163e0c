//! Batched asynchronous file I/O.
//!
//! An [`IoRing`] accepts typed requests (open, read, write, vectored read and write, flush,
//! stat, close, cancel), pushes them to the kernel in batches, and reports each result by
//! invoking the request's callback. On Linux the kernel's io_uring interface does the work; an
//! emulated backend performing ordinary system calls stands in where io_uring is unavailable.
//!
//! # Example
//!
//! ```no_run
//! use ioring::{IoRing, Open, OpenMode, Read, Request};
//! use std::sync::mpsc;
//!
//! let ring = IoRing::shared_instance().expect("ring unavailable");
//!
//! let (tx, rx) = mpsc::channel();
//! let open = Request::new(Open::new("input.txt", OpenMode::READ_ONLY))
//!     .with_callback(move |req| tx.send(req.result().copied()).unwrap());
//! let handle = ring.queue_request(open);
//! ring.wait_for_request(handle, None);
//! let fd = rx.recv().unwrap().unwrap().unwrap().fd;
//!
//! let (tx, rx) = mpsc::channel();
//! let read = Request::new(Read::new(fd, 6, vec![0u8; 5]))
//!     .with_callback(move |req| tx.send(req.into_op().destination).unwrap());
//! let handle = ring.queue_request(read);
//! ring.wait_for_request(handle, None);
//! assert_eq!(rx.recv().unwrap(), b"ipsum");
//! ```
//!
//! # Ordering
//!
//! Requests may complete in any order. [`Close`] and [`Flush`] are barriers: they start only
//! after everything submitted before them has completed, and nothing queued after a flush is
//! submitted until the flush completes.

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(not(unix))]
compile_error!("ioring supports Unix targets only");

mod backend;
pub mod config;
pub mod error;
mod handle;
mod operation;
mod pending;
pub mod request;
mod ring;
mod sys;

pub use config::{BackendKind, RingConfig};
pub use error::{FileError, RingError};
pub use handle::RequestHandle;
pub use operation::{OpenMode, Operation};
pub use request::{
    CancelStatus, Cancel, Close, Flush, IoOperation, Open, OpenResult, Read, ReadResult, Request,
    Stat, StatResult, VectoredRead, VectoredWrite, Write, WriteResult,
};
pub use ring::IoRing;

/// Submission queue entries of the shared ring
pub const DEFAULT_SUBMISSION_QUEUE_SIZE: u32 = 128;

/// Completion queue entries of the shared ring
pub const DEFAULT_COMPLETION_QUEUE_SIZE: u32 = 256;

/// Largest transfer a single read or write (all buffers together) may request
pub const MAX_RW_COUNT: u64 = 0x7fff_f000;

/// Largest number of buffers in one vectored request
pub const IOV_MAX: usize = 1024;
