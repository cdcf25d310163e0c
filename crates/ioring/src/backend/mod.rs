//! Execution engines behind [`IoRing`](crate::IoRing).
//!
//! A backend accepts prepared submission entries, hands them to whatever executes them, and
//! reports completion events carrying the entry's `user_data` and a result that is either a
//! non-negative byte count/descriptor or a negated `errno`.

pub(crate) mod emulated;
#[cfg(target_os = "linux")]
pub(crate) mod uring;

use crate::config::{BackendKind, RingConfig};
use crate::error::RingError;
use crate::sys::StatBuf;
use crate::Operation;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

/// One prepared operation.
///
/// Pointers reference memory owned by the pending request and stay valid until the entry's
/// completion has been reaped.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Entry {
    OpenAt {
        path: *const libc::c_char,
        flags: i32,
        mode: u32,
    },
    Close {
        fd: RawFd,
    },
    Read {
        fd: RawFd,
        offset: u64,
        buf: *mut u8,
        len: u32,
    },
    Write {
        fd: RawFd,
        offset: u64,
        buf: *const u8,
        len: u32,
    },
    Readv {
        fd: RawFd,
        offset: u64,
        iovecs: *const libc::iovec,
        count: u32,
    },
    Writev {
        fd: RawFd,
        offset: u64,
        iovecs: *const libc::iovec,
        count: u32,
    },
    Fsync {
        fd: RawFd,
    },
    Statx {
        fd: RawFd,
        buf: *mut StatBuf,
    },
    Cancel {
        target: u64,
    },
}

/// A submission entry: operation, correlation token and ordering flag
#[derive(Debug, Clone, Copy)]
pub(crate) struct Submission {
    pub user_data: u64,
    pub entry: Entry,
    /// Start only after every previously submitted entry has completed
    pub drain: bool,
}

// SAFETY: The raw pointers inside a submission point into heap storage owned by the pending
// request in the ring's table. That storage is neither moved nor freed until the matching
// completion is reaped, and the ring only touches a submission while holding its state lock.
unsafe impl Send for Submission {}

/// Completion event from a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    /// `user_data` of the submission this completes
    pub user_data: u64,
    /// Bytes transferred, descriptor opened, or a negated `errno`
    pub result: i32,
}

impl Completion {
    pub(crate) fn is_success(&self) -> bool {
        self.result >= 0
    }

    pub(crate) fn error_code(&self) -> Option<i32> {
        if self.result < 0 {
            Some(-self.result)
        } else {
            None
        }
    }
}

/// Blocks a waiter until a backend has completions to reap
pub(crate) trait Wakeup: Send + Sync {
    /// Wait until signalled or `deadline` passes. Returns false on timeout.
    fn wait(&self, deadline: Option<Instant>) -> bool;

    /// Wake the current waiter without a completion
    fn notify(&self);
}

/// An execution engine
pub(crate) trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Submission queue entries actually allocated
    fn submission_queue_size(&self) -> u32;

    /// Completion queue entries actually allocated
    fn completion_queue_size(&self) -> u32;

    fn supports(&self, operation: Operation) -> bool;

    /// Stage one entry. Returns false if the submission queue is full.
    ///
    /// # Safety
    ///
    /// Every pointer in `submission` must stay valid until its completion is reaped.
    unsafe fn push(&mut self, submission: &Submission) -> bool;

    /// Hand staged entries to the executor
    fn submit(&mut self) -> io::Result<usize>;

    /// Move every available completion into `out`, resetting the wakeup first
    fn reap(&mut self, out: &mut Vec<Completion>);

    fn wakeup(&self) -> Arc<dyn Wakeup>;
}

/// Build the backend `config` asks for
pub(crate) fn create(config: &RingConfig) -> Result<Box<dyn Backend>, RingError> {
    config.validate()?;
    let sq = config.submission_queue_size;
    let cq = config.completion_queue_size;

    match config.backend {
        BackendKind::Emulated => Ok(Box::new(emulated::EmulatedBackend::new(sq, cq))),
        #[cfg(target_os = "linux")]
        BackendKind::IoUring => Ok(Box::new(uring::UringBackend::new(sq, cq)?)),
        #[cfg(not(target_os = "linux"))]
        BackendKind::IoUring => Err(RingError::Unavailable("io_uring")),
        #[cfg(target_os = "linux")]
        BackendKind::Auto => match uring::UringBackend::new(sq, cq) {
            Ok(backend) => Ok(Box::new(backend)),
            Err(e) => {
                tracing::warn!("io_uring unavailable ({}), using emulated backend", e);
                Ok(Box::new(emulated::EmulatedBackend::new(sq, cq)))
            }
        },
        #[cfg(not(target_os = "linux"))]
        BackendKind::Auto => Ok(Box::new(emulated::EmulatedBackend::new(sq, cq))),
    }
}
