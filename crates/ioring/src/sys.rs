//! Thin wrappers over the system calls the backends share.

use crate::backend::Wakeup;
use crate::request::StatResult;
use std::io;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Metadata buffer filled by a stat request
#[cfg(target_os = "linux")]
pub(crate) type StatBuf = libc::statx;

/// Metadata buffer filled by a stat request
#[cfg(not(target_os = "linux"))]
pub(crate) type StatBuf = libc::stat;

/// Heap-allocated, zeroed metadata buffer
pub(crate) fn stat_buf() -> Box<StatBuf> {
    // SAFETY: StatBuf is a plain C struct of integers for which all-zero bytes are valid.
    Box::new(unsafe { std::mem::zeroed() })
}

#[cfg(target_os = "linux")]
pub(crate) fn stat_result(buf: &StatBuf) -> StatResult {
    let modified = if buf.stx_mask & libc::STATX_MTIME != 0 {
        timestamp(buf.stx_mtime.tv_sec, buf.stx_mtime.tv_nsec)
    } else {
        None
    };
    StatResult {
        size: buf.stx_size,
        mode: u32::from(buf.stx_mode),
        modified,
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn stat_result(buf: &StatBuf) -> StatResult {
    StatResult {
        size: u64::try_from(buf.st_size).unwrap_or(0),
        mode: buf.st_mode as u32,
        modified: timestamp(buf.st_mtime as i64, buf.st_mtime_nsec as u32),
    }
}

fn timestamp(secs: i64, nanos: u32) -> Option<SystemTime> {
    let since_epoch = Duration::new(secs.unsigned_abs(), nanos.min(999_999_999));
    if secs >= 0 {
        UNIX_EPOCH.checked_add(since_epoch)
    } else {
        UNIX_EPOCH.checked_sub(since_epoch)
    }
}

/// `errno` of the last failed call, as a negative completion result
pub(crate) fn last_error_result() -> i32 {
    -io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Milliseconds until `deadline` as a `poll(2)` timeout, rounded up
#[cfg(target_os = "linux")]
fn poll_timeout(deadline: Option<Instant>) -> libc::c_int {
    match deadline {
        None => -1,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut millis = remaining.as_millis();
            if remaining > Duration::from_millis(millis as u64) {
                millis += 1;
            }
            libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
        }
    }
}

/// Non-blocking eventfd signalled by the kernel whenever a completion is posted
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub(crate) struct EventFd(OwnedFd);

#[cfg(target_os = "linux")]
impl EventFd {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no pointer arguments; a non-negative return is a fresh descriptor.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just created and is owned by nothing else.
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Reset the counter; a no-op if it is already zero
    pub(crate) fn clear(&self) {
        let mut value: u64 = 0;
        // SAFETY: reads 8 bytes into a local u64.
        let _ = unsafe {
            libc::read(
                self.raw(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
    }
}

#[cfg(target_os = "linux")]
impl Wakeup for EventFd {
    fn wait(&self, deadline: Option<Instant>) -> bool {
        loop {
            let mut pollfd = libc::pollfd {
                fd: self.raw(),
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout = poll_timeout(deadline);
            // SAFETY: pollfd is a single valid entry on the stack.
            let ret = unsafe { libc::poll(&mut pollfd, 1, timeout) };
            if ret > 0 {
                return true;
            }
            if ret == 0 {
                return false;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::warn!("poll on completion eventfd failed: {}", err);
                return false;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
        }
    }

    fn notify(&self) {
        let value: u64 = 1;
        // SAFETY: writes 8 bytes from a local u64.
        let _ = unsafe {
            libc::write(
                self.raw(),
                (&value as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
    }
}

/// Level-triggered flag with a condition variable, used where no kernel notifier exists
#[derive(Debug, Default)]
pub(crate) struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn clear(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

impl Wakeup for Signal {
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        while !*raised {
            match deadline {
                None => {
                    raised = self.cond.wait(raised).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    raised = self
                        .cond
                        .wait_timeout(raised, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
        true
    }

    fn notify(&self) {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_timeout() {
        let signal = Signal::default();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(!signal.wait(Some(deadline)));
    }

    #[test]
    fn test_signal_is_level_triggered() {
        let signal = Signal::default();
        signal.notify();
        assert!(signal.wait(Some(Instant::now())));
        assert!(signal.wait(None));
        signal.clear();
        assert!(!signal.wait(Some(Instant::now())));
    }

    #[test]
    fn test_signal_wakes_other_thread() {
        let signal = Arc::new(Signal::default());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait(Some(Instant::now() + Duration::from_secs(10))))
        };
        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(waiter.join().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_eventfd_notify_and_clear() {
        let eventfd = EventFd::new().unwrap();
        assert!(!eventfd.wait(Some(Instant::now())));

        eventfd.notify();
        assert!(eventfd.wait(Some(Instant::now() + Duration::from_secs(1))));

        eventfd.clear();
        assert!(!eventfd.wait(Some(Instant::now() + Duration::from_millis(5))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout(None), -1);
        let timeout = poll_timeout(Some(Instant::now() + Duration::from_micros(1500)));
        assert!((1..=2).contains(&timeout));
        assert_eq!(poll_timeout(Some(Instant::now())), 0);
    }

    #[test]
    fn test_timestamp_conversion() {
        let ts = timestamp(10, 5).unwrap();
        assert_eq!(
            ts.duration_since(UNIX_EPOCH).unwrap(),
            Duration::new(10, 5)
        );
        assert!(timestamp(-1, 0).unwrap() < UNIX_EPOCH);
    }
}
