//! Backend that performs each staged entry as a blocking system call at submission time.
//!
//! Used where io_uring is missing or blocked (older kernels, seccomp-filtered containers,
//! non-Linux Unix). Completions are buffered until reaped, so callers observe the same
//! submit/complete/reap cycle as with the kernel ring.

use super::{Backend, Completion, Entry, Submission, Wakeup};
use crate::config::BackendKind;
use crate::sys::{self, Signal, StatBuf};
use crate::Operation;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

pub(crate) struct EmulatedBackend {
    sq_entries: u32,
    cq_entries: u32,
    staged: VecDeque<Submission>,
    completed: VecDeque<Completion>,
    signal: Arc<Signal>,
}

impl EmulatedBackend {
    pub(crate) fn new(sq_entries: u32, cq_entries: u32) -> Self {
        let sq_entries = sq_entries.max(1).next_power_of_two();
        let cq_entries = cq_entries.max(sq_entries).next_power_of_two();
        tracing::debug!(sq_entries, cq_entries, "emulated backend ready");
        Self {
            sq_entries,
            cq_entries,
            staged: VecDeque::with_capacity(sq_entries as usize),
            completed: VecDeque::with_capacity(cq_entries as usize),
            signal: Arc::new(Signal::default()),
        }
    }
}

impl Backend for EmulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Emulated
    }

    fn submission_queue_size(&self) -> u32 {
        self.sq_entries
    }

    fn completion_queue_size(&self) -> u32 {
        self.cq_entries
    }

    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    unsafe fn push(&mut self, submission: &Submission) -> bool {
        if self.staged.len() >= self.sq_entries as usize {
            return false;
        }
        self.staged.push_back(*submission);
        true
    }

    fn submit(&mut self) -> io::Result<usize> {
        let count = self.staged.len();
        while let Some(submission) = self.staged.pop_front() {
            // SAFETY: push() callers guarantee the pointers stay valid until the completion
            // is reaped, which cannot happen before this call returns.
            let result = unsafe { execute(&submission.entry) };
            self.completed.push_back(Completion {
                user_data: submission.user_data,
                result,
            });
        }
        if count > 0 {
            self.signal.notify();
        }
        Ok(count)
    }

    fn reap(&mut self, out: &mut Vec<Completion>) {
        self.signal.clear();
        out.extend(self.completed.drain(..));
    }

    fn wakeup(&self) -> Arc<dyn Wakeup> {
        self.signal.clone()
    }
}

/// Run one entry synchronously, returning a completion result
///
/// # Safety
///
/// Every pointer in `entry` must be valid for the access the operation performs.
unsafe fn execute(entry: &Entry) -> i32 {
    let ret: isize = match *entry {
        Entry::OpenAt { path, flags, mode } => {
            retry(|| unsafe { libc::open(path, flags, mode as libc::c_uint) as isize })
        }
        Entry::Close { fd } => unsafe { libc::close(fd) as isize },
        Entry::Read {
            fd,
            offset,
            buf,
            len,
        } => {
            let Ok(offset) = libc::off_t::try_from(offset) else {
                return -libc::EINVAL;
            };
            retry(|| unsafe { libc::pread(fd, buf.cast(), len as usize, offset) })
        }
        Entry::Write {
            fd,
            offset,
            buf,
            len,
        } => {
            let Ok(offset) = libc::off_t::try_from(offset) else {
                return -libc::EINVAL;
            };
            retry(|| unsafe { libc::pwrite(fd, buf.cast(), len as usize, offset) })
        }
        Entry::Readv {
            fd,
            offset,
            iovecs,
            count,
        } => {
            let iovecs = unsafe { std::slice::from_raw_parts(iovecs, count as usize) };
            return vectored(iovecs, offset, |iov, offset| unsafe {
                libc::pread(fd, iov.iov_base, iov.iov_len, offset)
            });
        }
        Entry::Writev {
            fd,
            offset,
            iovecs,
            count,
        } => {
            let iovecs = unsafe { std::slice::from_raw_parts(iovecs, count as usize) };
            return vectored(iovecs, offset, |iov, offset| unsafe {
                libc::pwrite(fd, iov.iov_base.cast_const(), iov.iov_len, offset)
            });
        }
        Entry::Fsync { fd } => retry(|| unsafe { libc::fsync(fd) as isize }),
        Entry::Statx { fd, buf } => unsafe { stat(fd, buf) },
        // Every staged entry has already run by the time a cancel reaches it.
        Entry::Cancel { .. } => return -libc::ENOENT,
    };

    if ret < 0 {
        sys::last_error_result()
    } else {
        i32::try_from(ret).unwrap_or(i32::MAX)
    }
}

fn retry(mut call: impl FnMut() -> isize) -> isize {
    loop {
        let ret = call();
        if ret >= 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return ret;
        }
    }
}

/// Positioned scatter/gather as a sequence of single-buffer calls. Stops at the first
/// short transfer, like `preadv`/`pwritev` do.
fn vectored(
    iovecs: &[libc::iovec],
    offset: u64,
    mut call: impl FnMut(&libc::iovec, libc::off_t) -> isize,
) -> i32 {
    let mut total: usize = 0;
    for iov in iovecs {
        if iov.iov_len == 0 {
            continue;
        }
        let Ok(position) = libc::off_t::try_from(offset + total as u64) else {
            return -libc::EINVAL;
        };
        let ret = retry(|| call(iov, position));
        if ret < 0 {
            if total > 0 {
                break;
            }
            return sys::last_error_result();
        }
        total += ret as usize;
        if (ret as usize) < iov.iov_len {
            break;
        }
    }
    i32::try_from(total).unwrap_or(i32::MAX)
}

#[cfg(target_os = "linux")]
unsafe fn stat(fd: libc::c_int, buf: *mut StatBuf) -> isize {
    unsafe {
        libc::syscall(
            libc::SYS_statx,
            fd,
            c"".as_ptr(),
            libc::AT_EMPTY_PATH,
            libc::STATX_BASIC_STATS,
            buf,
        ) as isize
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn stat(fd: libc::c_int, buf: *mut StatBuf) -> isize {
    unsafe { libc::fstat(fd, buf) as isize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::fd::AsRawFd;
    use tempfile::NamedTempFile;

    fn run(backend: &mut EmulatedBackend, entry: Entry) -> i32 {
        let submission = Submission {
            user_data: 42,
            entry,
            drain: false,
        };
        assert!(unsafe { backend.push(&submission) });
        assert_eq!(backend.submit().unwrap(), 1);

        let mut out = Vec::new();
        backend.reap(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].user_data, 42);
        out[0].result
    }

    #[test]
    fn test_sizes_round_up() {
        let backend = EmulatedBackend::new(3, 2);
        assert_eq!(backend.submission_queue_size(), 4);
        assert_eq!(backend.completion_queue_size(), 4);
    }

    #[test]
    fn test_push_respects_capacity() {
        let mut backend = EmulatedBackend::new(1, 1);
        let submission = Submission {
            user_data: 1,
            entry: Entry::Close { fd: -1 },
            drain: false,
        };
        assert!(unsafe { backend.push(&submission) });
        assert!(!unsafe { backend.push(&submission) });
        assert_eq!(backend.submit().unwrap(), 1);
        assert!(unsafe { backend.push(&submission) });
    }

    #[test]
    fn test_read_write() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"lorem ipsum").unwrap();
        let fd = file.as_file().as_raw_fd();
        let mut backend = EmulatedBackend::new(4, 4);

        let mut buf = vec![0u8; 5];
        let res = run(
            &mut backend,
            Entry::Read {
                fd,
                offset: 6,
                buf: buf.as_mut_ptr(),
                len: 5,
            },
        );
        assert_eq!(res, 5);
        assert_eq!(&buf, b"ipsum");

        let data = b"LOREM";
        let res = run(
            &mut backend,
            Entry::Write {
                fd,
                offset: 0,
                buf: data.as_ptr(),
                len: 5,
            },
        );
        assert_eq!(res, 5);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"LOREM ipsum");
    }

    #[test]
    fn test_vectored_read_stops_at_eof() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abcdef").unwrap();
        let fd = file.as_file().as_raw_fd();
        let mut backend = EmulatedBackend::new(4, 4);

        let mut first = vec![0u8; 4];
        let mut second = vec![0u8; 4];
        let iovecs = [
            libc::iovec {
                iov_base: first.as_mut_ptr().cast(),
                iov_len: first.len(),
            },
            libc::iovec {
                iov_base: second.as_mut_ptr().cast(),
                iov_len: second.len(),
            },
        ];
        let res = run(
            &mut backend,
            Entry::Readv {
                fd,
                offset: 0,
                iovecs: iovecs.as_ptr(),
                count: 2,
            },
        );
        assert_eq!(res, 6);
        assert_eq!(&first, b"abcd");
        assert_eq!(&second[..2], b"ef");
    }

    #[test]
    fn test_stat_and_errors() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"lorem ipsum").unwrap();
        let fd = file.as_file().as_raw_fd();
        let mut backend = EmulatedBackend::new(4, 4);

        let mut buf = sys::stat_buf();
        let res = run(
            &mut backend,
            Entry::Statx {
                fd,
                buf: &mut *buf,
            },
        );
        assert_eq!(res, 0);
        assert_eq!(sys::stat_result(&buf).size, 11);

        assert_eq!(run(&mut backend, Entry::Fsync { fd: -1 }), -libc::EBADF);
        assert_eq!(run(&mut backend, Entry::Cancel { target: 7 }), -libc::ENOENT);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = std::ffi::CString::new(dir.path().join("missing").into_os_string().into_encoded_bytes())
            .unwrap();
        let mut backend = EmulatedBackend::new(1, 1);
        let res = run(
            &mut backend,
            Entry::OpenAt {
                path: path.as_ptr(),
                flags: libc::O_RDONLY | libc::O_CLOEXEC,
                mode: 0o666,
            },
        );
        assert_eq!(res, -libc::ENOENT);
    }
}
