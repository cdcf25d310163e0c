//! Kernel io_uring backend (Linux-only).
//!
//! Completions are announced through an eventfd registered with the ring, so waiters block in
//! `poll(2)` without holding the ring's lock and several threads can share one ring.

use super::{Backend, Completion, Entry, Submission, Wakeup};
use crate::config::BackendKind;
use crate::error::RingError;
use crate::sys::EventFd;
use crate::Operation;
use io_uring::{IoUring, Probe, opcode, squeue, types};
use std::io;
use std::sync::Arc;

pub(crate) struct UringBackend {
    ring: IoUring,
    eventfd: Arc<EventFd>,
    supported: [bool; Operation::ALL.len()],
}

impl UringBackend {
    /// Set up a ring with at least `sq_entries` submission and `cq_entries` completion slots
    pub(crate) fn new(sq_entries: u32, cq_entries: u32) -> Result<Self, RingError> {
        let cq_entries = cq_entries.max(sq_entries);
        let ring = IoUring::builder()
            .setup_cqsize(cq_entries)
            .build(sq_entries)
            .map_err(RingError::Setup)?;

        let eventfd = EventFd::new().map_err(RingError::Notifier)?;
        ring.submitter()
            .register_eventfd(eventfd.raw())
            .map_err(RingError::Notifier)?;

        // Probe for supported operations
        let mut probe = Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(RingError::Probe)?;

        let mut supported = [false; Operation::ALL.len()];
        for (slot, operation) in supported.iter_mut().zip(Operation::ALL) {
            *slot = probe.is_supported(opcode_for(operation));
        }

        // Reads and writes are the floor; without them the emulated backend is the better choice
        for required in [Operation::Read, Operation::Write] {
            if !supported[required as usize] {
                return Err(RingError::UnsupportedOperation(required));
            }
        }

        tracing::debug!(
            sq_entries = ring.params().sq_entries(),
            cq_entries = ring.params().cq_entries(),
            "io_uring backend ready"
        );

        Ok(Self {
            ring,
            eventfd: Arc::new(eventfd),
            supported,
        })
    }
}

fn opcode_for(operation: Operation) -> u8 {
    match operation {
        Operation::Open => opcode::OpenAt::CODE,
        Operation::Close => opcode::Close::CODE,
        Operation::Read => opcode::Read::CODE,
        Operation::Write => opcode::Write::CODE,
        Operation::VectoredRead => opcode::Readv::CODE,
        Operation::VectoredWrite => opcode::Writev::CODE,
        Operation::Flush => opcode::Fsync::CODE,
        Operation::Stat => opcode::Statx::CODE,
        Operation::Cancel => opcode::AsyncCancel::CODE,
    }
}

fn build(entry: &Entry) -> squeue::Entry {
    match *entry {
        Entry::OpenAt { path, flags, mode } => {
            opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path)
                .flags(flags)
                .mode(mode)
                .build()
        }
        Entry::Close { fd } => opcode::Close::new(types::Fd(fd)).build(),
        Entry::Read {
            fd,
            offset,
            buf,
            len,
        } => opcode::Read::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build(),
        Entry::Write {
            fd,
            offset,
            buf,
            len,
        } => opcode::Write::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build(),
        Entry::Readv {
            fd,
            offset,
            iovecs,
            count,
        } => opcode::Readv::new(types::Fd(fd), iovecs, count)
            .offset(offset)
            .build(),
        Entry::Writev {
            fd,
            offset,
            iovecs,
            count,
        } => opcode::Writev::new(types::Fd(fd), iovecs, count)
            .offset(offset)
            .build(),
        Entry::Fsync { fd } => opcode::Fsync::new(types::Fd(fd)).build(),
        Entry::Statx { fd, buf } => {
            opcode::Statx::new(types::Fd(fd), c"".as_ptr(), buf.cast::<types::statx>())
                .flags(libc::AT_EMPTY_PATH)
                .mask(libc::STATX_BASIC_STATS)
                .build()
        }
        Entry::Cancel { target } => opcode::AsyncCancel::new(target).build(),
    }
}

impl Backend for UringBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::IoUring
    }

    fn submission_queue_size(&self) -> u32 {
        self.ring.params().sq_entries()
    }

    fn completion_queue_size(&self) -> u32 {
        self.ring.params().cq_entries()
    }

    fn supports(&self, operation: Operation) -> bool {
        self.supported[operation as usize]
    }

    unsafe fn push(&mut self, submission: &Submission) -> bool {
        let mut entry = build(&submission.entry).user_data(submission.user_data);
        if submission.drain {
            entry = entry.flags(squeue::Flags::IO_DRAIN);
        }

        // SAFETY: Buffers referenced by the entry stay valid until its completion is reaped,
        // which is the caller's contract for push().
        unsafe { self.ring.submission().push(&entry).is_ok() }
    }

    fn submit(&mut self) -> io::Result<usize> {
        loop {
            match self.ring.submit() {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn reap(&mut self, out: &mut Vec<Completion>) {
        // Reset before draining so a completion posted in between re-arms the eventfd.
        self.eventfd.clear();
        for cqe in self.ring.completion() {
            out.push(Completion {
                user_data: cqe.user_data(),
                result: cqe.result(),
            });
        }
    }

    fn wakeup(&self) -> Arc<dyn Wakeup> {
        self.eventfd.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use std::io::Write as _;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};
    use tempfile::NamedTempFile;

    /// io_uring may be disabled in the sandbox running the tests
    fn backend(sq: u32, cq: u32) -> Option<UringBackend> {
        match UringBackend::new(sq, cq) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping io_uring test: {e}");
                None
            }
        }
    }

    fn complete_one(backend: &mut UringBackend) -> Completion {
        let wakeup = backend.wakeup();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.is_empty() {
            backend.reap(&mut out);
            if out.is_empty() {
                assert!(wakeup.wait(Some(deadline)), "no completion within 5s");
            }
        }
        out[0]
    }

    #[test]
    fn test_io_uring_creation() {
        let Some(backend) = backend(1, 2) else { return };
        assert!(backend.submission_queue_size() >= 1);
        assert!(backend.completion_queue_size() >= 2);
        assert!(backend.supports(Operation::Read));
        assert!(backend.supports(Operation::Write));
    }

    #[test]
    fn test_io_uring_read() {
        let Some(mut backend) = backend(8, 16) else { return };
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"lorem ipsum").unwrap();

        let mut buf = vec![0u8; 5];
        let submission = Submission {
            user_data: 99,
            entry: Entry::Read {
                fd: file.as_file().as_raw_fd(),
                offset: 6,
                buf: buf.as_mut_ptr(),
                len: 5,
            },
            drain: false,
        };
        assert!(unsafe { backend.push(&submission) });
        assert_eq!(backend.submit().unwrap(), 1);

        let completion = complete_one(&mut backend);
        assert_eq!(completion.user_data, 99);
        assert_eq!(completion.result, 5);
        assert_eq!(&buf, b"ipsum");
    }

    #[test]
    fn test_io_uring_statx() {
        let Some(mut backend) = backend(8, 16) else { return };
        if !backend.supports(Operation::Stat) {
            return;
        }
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"lorem ipsum").unwrap();

        let mut buf = sys::stat_buf();
        let submission = Submission {
            user_data: 1,
            entry: Entry::Statx {
                fd: file.as_file().as_raw_fd(),
                buf: &mut *buf,
            },
            drain: false,
        };
        assert!(unsafe { backend.push(&submission) });
        backend.submit().unwrap();

        assert_eq!(complete_one(&mut backend).result, 0);
        assert_eq!(sys::stat_result(&buf).size, 11);
    }

    #[test]
    fn test_io_uring_queue_full() {
        let Some(mut backend) = backend(1, 2) else { return };
        let capacity = backend.submission_queue_size();
        let submission = Submission {
            user_data: 0,
            entry: Entry::Fsync { fd: -1 },
            drain: false,
        };
        for _ in 0..capacity {
            assert!(unsafe { backend.push(&submission) });
        }
        assert!(!unsafe { backend.push(&submission) });
        assert_eq!(backend.submit().unwrap(), capacity as usize);
    }
}
