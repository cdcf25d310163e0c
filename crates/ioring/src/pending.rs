//! Bookkeeping for one queued request: preparing submission entries and applying completions.
//!
//! A request may be submitted several times. Short reads and writes are continued from where
//! the previous attempt stopped, so [`Pending::prepare`] always describes the remainder.

use crate::backend::{Completion, Entry};
use crate::request::{AnyRequest, CancelStatus, OpenResult, ReadResult, WriteResult};
use crate::sys::{self, StatBuf};
use crate::{FileError, Operation, RequestHandle, IOV_MAX, MAX_RW_COUNT};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

/// Permission bits for files created by an open request, before the umask
pub(crate) const CREATE_MODE: u32 = 0o666;

/// Where a request sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Waiting for submission queue or completion budget
    Backlog,
    /// Pushed to the backend
    InFlight,
    /// Result set, callback not yet taken
    Ready,
    /// Callback running on some thread
    Dispatching,
}

/// Outcome of preparing a request for submission
pub(crate) enum Prepared {
    Submit(Entry),
    /// The result is already known; nothing goes to the backend
    Done,
}

/// Outcome of applying a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Finished,
    /// Short transfer; submit the remainder
    Continue,
}

/// Memory referenced by an in-flight submission entry
#[derive(Default)]
struct Scratch {
    path: Option<CString>,
    stat: Option<Box<StatBuf>>,
    iovecs: Vec<libc::iovec>,
}

// SAFETY: The iovecs only point into buffers owned by the same Pending's request, which moves
// between threads together with them.
unsafe impl Send for Scratch {}

pub(crate) struct Pending {
    request: Option<AnyRequest>,
    pub(crate) stage: Stage,
    /// Bytes already transferred by earlier submissions
    pub(crate) progress: u64,
    operation: Operation,
    scratch: Scratch,
}

impl Pending {
    pub(crate) fn new(request: AnyRequest) -> Self {
        Self {
            operation: request.operation(),
            request: Some(request),
            stage: Stage::Backlog,
            progress: 0,
            scratch: Scratch::default(),
        }
    }

    pub(crate) fn operation(&self) -> Operation {
        self.operation
    }

    /// Whether a short transfer is being continued
    pub(crate) fn is_partial(&self) -> bool {
        self.progress > 0
    }

    pub(crate) fn cancel_target(&self) -> Option<RequestHandle> {
        match &self.request {
            Some(AnyRequest::Cancel(req)) => Some(req.op().target),
            _ => None,
        }
    }

    /// Record `error` as the outcome and release submission memory
    pub(crate) fn fail(&mut self, error: FileError) {
        if let Some(request) = self.request.as_mut() {
            request.fail(error);
        }
        self.scratch = Scratch::default();
    }

    pub(crate) fn resolve_cancel(&mut self, status: CancelStatus) {
        if let Some(AnyRequest::Cancel(req)) = self.request.as_mut() {
            req.set_result(Ok(status));
        }
    }

    /// Take the finished request for dispatch
    pub(crate) fn take(&mut self) -> Option<AnyRequest> {
        self.stage = Stage::Dispatching;
        self.scratch = Scratch::default();
        self.request.take()
    }

    /// Build the next submission entry, or settle the request without the backend.
    ///
    /// Cancel requests are resolved by the ring, which knows the state of the target.
    pub(crate) fn prepare(&mut self) -> Prepared {
        let progress = self.progress;
        let scratch = &mut self.scratch;
        let Some(request) = self.request.as_mut() else {
            return Prepared::Done;
        };

        match request {
            AnyRequest::Open(req) => {
                let path = match CString::new(req.op().path.as_os_str().as_bytes()) {
                    Ok(path) => path,
                    Err(_) => {
                        req.fail(FileError::InvalidArgument);
                        return Prepared::Done;
                    }
                };
                let flags = req.op().mode.to_open_flags();
                let path = scratch.path.insert(path);
                Prepared::Submit(Entry::OpenAt {
                    path: path.as_ptr(),
                    flags,
                    mode: CREATE_MODE,
                })
            }
            AnyRequest::Close(req) => {
                let fd = req.op().fd;
                if fd < 0 {
                    req.fail(FileError::BadDescriptor);
                    return Prepared::Done;
                }
                Prepared::Submit(Entry::Close { fd })
            }
            AnyRequest::Flush(req) => {
                let fd = req.op().fd;
                if fd < 0 {
                    req.fail(FileError::BadDescriptor);
                    return Prepared::Done;
                }
                Prepared::Submit(Entry::Fsync { fd })
            }
            AnyRequest::Stat(req) => {
                let fd = req.op().fd;
                if fd < 0 {
                    req.fail(FileError::BadDescriptor);
                    return Prepared::Done;
                }
                let buf = scratch.stat.insert(sys::stat_buf());
                Prepared::Submit(Entry::Statx {
                    fd,
                    buf: &mut **buf,
                })
            }
            AnyRequest::Read(req) => {
                let op = req.op_mut();
                let (fd, offset, total) = (op.fd, op.offset, op.destination.len() as u64);
                let position = match check_transfer(fd, offset, total)
                    .and_then(|()| continue_at(offset, progress))
                {
                    Ok(position) => position,
                    Err(e) => {
                        req.fail(e);
                        return Prepared::Done;
                    }
                };
                if total == 0 {
                    req.set_result(Ok(ReadResult { bytes_read: 0 }));
                    return Prepared::Done;
                }
                let rest = &mut op.destination[progress as usize..];
                Prepared::Submit(Entry::Read {
                    fd,
                    offset: position,
                    buf: rest.as_mut_ptr(),
                    len: rest.len() as u32,
                })
            }
            AnyRequest::Write(req) => {
                let op = req.op();
                let (fd, offset, total) = (op.fd, op.offset, op.source.len() as u64);
                let position = match check_transfer(fd, offset, total)
                    .and_then(|()| continue_at(offset, progress))
                {
                    Ok(position) => position,
                    Err(e) => {
                        req.fail(e);
                        return Prepared::Done;
                    }
                };
                if total == 0 {
                    req.set_result(Ok(WriteResult { bytes_written: 0 }));
                    return Prepared::Done;
                }
                let rest = &op.source[progress as usize..];
                Prepared::Submit(Entry::Write {
                    fd,
                    offset: position,
                    buf: rest.as_ptr(),
                    len: rest.len() as u32,
                })
            }
            AnyRequest::VectoredRead(req) => {
                let op = req.op_mut();
                let (fd, offset) = (op.fd, op.offset);
                let lengths = op.destinations.iter().map(Vec::len);
                let (total, position) = match check_vectored(fd, offset, lengths)
                    .and_then(|total| Ok((total, continue_at(offset, progress)?)))
                {
                    Ok(checked) => checked,
                    Err(e) => {
                        req.fail(e);
                        return Prepared::Done;
                    }
                };
                if total == 0 {
                    req.set_result(Ok(ReadResult { bytes_read: 0 }));
                    return Prepared::Done;
                }
                scratch.iovecs = remaining_iovecs(
                    op.destinations
                        .iter_mut()
                        .map(|buf| (buf.as_mut_ptr(), buf.len())),
                    progress,
                );
                Prepared::Submit(Entry::Readv {
                    fd,
                    offset: position,
                    iovecs: scratch.iovecs.as_ptr(),
                    count: scratch.iovecs.len() as u32,
                })
            }
            AnyRequest::VectoredWrite(req) => {
                let op = req.op();
                let (fd, offset) = (op.fd, op.offset);
                let lengths = op.sources.iter().map(Vec::len);
                let (total, position) = match check_vectored(fd, offset, lengths)
                    .and_then(|total| Ok((total, continue_at(offset, progress)?)))
                {
                    Ok(checked) => checked,
                    Err(e) => {
                        req.fail(e);
                        return Prepared::Done;
                    }
                };
                if total == 0 {
                    req.set_result(Ok(WriteResult { bytes_written: 0 }));
                    return Prepared::Done;
                }
                // The kernel only reads through these pointers for a write.
                scratch.iovecs = remaining_iovecs(
                    op.sources
                        .iter()
                        .map(|buf| (buf.as_ptr().cast_mut(), buf.len())),
                    progress,
                );
                Prepared::Submit(Entry::Writev {
                    fd,
                    offset: position,
                    iovecs: scratch.iovecs.as_ptr(),
                    count: scratch.iovecs.len() as u32,
                })
            }
            AnyRequest::Cancel(req) => {
                req.set_result(Ok(CancelStatus::NotFound));
                Prepared::Done
            }
        }
    }

    /// Apply a backend completion to the request
    pub(crate) fn complete(&mut self, completion: Completion) -> Step {
        let res = completion.result;
        let progress = &mut self.progress;
        let Some(request) = self.request.as_mut() else {
            return Step::Finished;
        };

        match request {
            AnyRequest::Open(req) => req.set_result(if completion.is_success() {
                Ok(OpenResult { fd: res })
            } else {
                Err(FileError::from_completion(res))
            }),
            AnyRequest::Close(req) => req.set_result(unit(res)),
            AnyRequest::Flush(req) => req.set_result(unit(res)),
            AnyRequest::Stat(req) => {
                let result = match self.scratch.stat.as_deref() {
                    Some(buf) if completion.is_success() => Ok(sys::stat_result(buf)),
                    Some(_) => Err(FileError::from_completion(res)),
                    None => Err(FileError::Io),
                };
                req.set_result(result);
            }
            AnyRequest::Read(req) => {
                let total = req.op().destination.len() as u64;
                match advance(progress, total, res, false) {
                    Ok(None) => return Step::Continue,
                    Ok(Some(bytes_read)) => req.set_result(Ok(ReadResult { bytes_read })),
                    Err(e) => req.fail(e),
                }
            }
            AnyRequest::VectoredRead(req) => {
                let total = req.op().destinations.iter().map(|b| b.len() as u64).sum();
                match advance(progress, total, res, false) {
                    Ok(None) => return Step::Continue,
                    Ok(Some(bytes_read)) => req.set_result(Ok(ReadResult { bytes_read })),
                    Err(e) => req.fail(e),
                }
            }
            AnyRequest::Write(req) => {
                let total = req.op().source.len() as u64;
                match advance(progress, total, res, true) {
                    Ok(None) => return Step::Continue,
                    Ok(Some(bytes_written)) => {
                        req.set_result(Ok(WriteResult { bytes_written }));
                    }
                    Err(e) => req.fail(e),
                }
            }
            AnyRequest::VectoredWrite(req) => {
                let total = req.op().sources.iter().map(|b| b.len() as u64).sum();
                match advance(progress, total, res, true) {
                    Ok(None) => return Step::Continue,
                    Ok(Some(bytes_written)) => {
                        req.set_result(Ok(WriteResult { bytes_written }));
                    }
                    Err(e) => req.fail(e),
                }
            }
            AnyRequest::Cancel(req) => req.set_result(match completion.error_code() {
                None => Ok(CancelStatus::Cancelled),
                Some(libc::ENOENT) => Ok(CancelStatus::NotFound),
                Some(libc::EALREADY) => Ok(CancelStatus::InProgress),
                Some(errno) => Err(FileError::from_errno(errno)),
            }),
        }
        Step::Finished
    }
}

fn unit(res: i32) -> Result<(), FileError> {
    if res < 0 {
        Err(FileError::from_completion(res))
    } else {
        Ok(())
    }
}

/// Largest file position a transfer may reach. io_uring reads an offset of `u64::MAX` as
/// "use the file cursor", so nothing at or beyond the signed range is passed through.
const MAX_OFFSET: u64 = i64::MAX as u64;

fn check_transfer(fd: i32, offset: u64, len: u64) -> Result<(), FileError> {
    if fd < 0 {
        return Err(FileError::BadDescriptor);
    }
    if len > MAX_RW_COUNT {
        return Err(FileError::TransferTooLarge {
            requested: len,
            limit: MAX_RW_COUNT,
        });
    }
    match offset.checked_add(len) {
        Some(end) if end <= MAX_OFFSET => Ok(()),
        _ => Err(FileError::InvalidArgument),
    }
}

fn check_vectored(
    fd: i32,
    offset: u64,
    lengths: impl ExactSizeIterator<Item = usize>,
) -> Result<u64, FileError> {
    if fd < 0 {
        return Err(FileError::BadDescriptor);
    }
    if lengths.len() > IOV_MAX {
        return Err(FileError::InvalidArgument);
    }
    let total: u64 = lengths.map(|len| len as u64).sum();
    check_transfer(fd, offset, total)?;
    Ok(total)
}

/// File position of the next submission of a transfer that has moved `progress` bytes
fn continue_at(offset: u64, progress: u64) -> Result<u64, FileError> {
    offset
        .checked_add(progress)
        .filter(|&position| position <= MAX_OFFSET)
        .ok_or(FileError::InvalidArgument)
}

/// iovecs covering everything past the first `skip` bytes
fn remaining_iovecs(
    buffers: impl Iterator<Item = (*mut u8, usize)>,
    mut skip: u64,
) -> Vec<libc::iovec> {
    let mut iovecs = Vec::new();
    for (ptr, len) in buffers {
        let len_u64 = len as u64;
        if skip >= len_u64 {
            skip -= len_u64;
            continue;
        }
        let start = skip as usize;
        skip = 0;
        iovecs.push(libc::iovec {
            // SAFETY: start < len, so the pointer stays inside the buffer.
            iov_base: unsafe { ptr.add(start) }.cast(),
            iov_len: len - start,
        });
    }
    iovecs
}

/// Fold one transfer result into `progress`.
///
/// Returns `Ok(None)` while bytes remain, `Ok(Some(total_transferred))` once finished.
/// A zero-byte read is end of file; a zero-byte write cannot make progress and is an error.
fn advance(progress: &mut u64, total: u64, res: i32, is_write: bool) -> Result<Option<u64>, FileError> {
    if res < 0 {
        return Err(FileError::from_completion(res));
    }
    if res == 0 {
        if is_write && *progress < total {
            return Err(FileError::Io);
        }
        return Ok(Some(*progress));
    }
    *progress += res as u64;
    if *progress >= total {
        Ok(Some(*progress))
    } else {
        Ok(None)
    }
}
