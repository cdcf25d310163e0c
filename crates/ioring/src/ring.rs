//! The ring engine: request tracking, flow control, and completion dispatch.
//!
//! All bookkeeping lives behind one mutex. Callbacks never run while it is held, so they may
//! queue further requests. Blocking waits elect a single poller: it sleeps on the backend's
//! wakeup outside the lock, reaps, dispatches, then wakes every other waiter through a
//! condition variable so each can re-check its own request.

use crate::backend::{self, Backend, Completion, Submission, Wakeup};
use crate::config::{BackendKind, RingConfig};
use crate::handle::{HandleTable, RequestHandle};
use crate::pending::{Pending, Prepared, Stage, Step};
use crate::request::{AnyRequest, CancelStatus, IoOperation, Request};
use crate::{FileError, Operation};
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

thread_local! {
    /// Set while this thread runs request callbacks
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

static SHARED: OnceLock<IoRing> = OnceLock::new();

/// `user_data` of the cancels issued on drop. Generation 0 never names a request.
const TEARDOWN_CANCEL: u64 = 0;

/// Batched asynchronous file I/O ring.
///
/// Requests are queued with [`IoRing::queue_request`], which returns at once with a
/// [`RequestHandle`]. Results are delivered by invoking each request's callback from whichever
/// thread next drains the ring through [`IoRing::wait_for_request`] or [`IoRing::drain`].
///
/// `IoRing` is `Send + Sync`; share it by reference or through an `Arc`.
pub struct IoRing {
    config: RingConfig,
    state: Mutex<RingState>,
    /// Signalled whenever the poller finishes a pass
    retired: Condvar,
}

struct RingState {
    backend: Option<Box<dyn Backend>>,
    wakeup: Option<Arc<dyn Wakeup>>,
    requests: HandleTable<Pending>,
    /// Requests not yet pushed to the backend, in staging order
    backlog: VecDeque<RequestHandle>,
    /// Requests finished without a backend completion
    ready: Vec<RequestHandle>,
    /// Entries pushed to the backend whose completion has not been reaped
    in_flight: u32,
    flush_in_flight: bool,
    /// Requests between two submissions of a short transfer
    partial: usize,
    /// A thread is reaping or running callbacks
    polling: bool,
    /// The ring is being dropped; backlog entries are aborted instead of staged
    closing: bool,
}

/// Requests taken out of the table for their callbacks to run
type Batch = Vec<(RequestHandle, AnyRequest)>;

impl IoRing {
    /// Create a ring with the given queue sizes. Nothing is allocated until
    /// [`IoRing::ensure_initialized`] or the first queued request.
    #[must_use]
    pub fn new(submission_queue_size: u32, completion_queue_size: u32) -> Self {
        Self::with_config(RingConfig::with_sizes(
            submission_queue_size,
            completion_queue_size,
        ))
    }

    /// Create a ring from a full configuration
    #[must_use]
    pub fn with_config(config: RingConfig) -> Self {
        let capacity = config.completion_queue_size as usize;
        Self {
            config,
            state: Mutex::new(RingState {
                backend: None,
                wakeup: None,
                requests: HandleTable::with_capacity(capacity),
                backlog: VecDeque::new(),
                ready: Vec::new(),
                in_flight: 0,
                flush_in_flight: false,
                partial: 0,
                polling: false,
                closing: false,
            }),
            retired: Condvar::new(),
        }
    }

    /// The process-wide ring, created on first use with the default queue sizes and the
    /// backend named by `IORING_BACKEND` (see [`RingConfig::from_env`]).
    ///
    /// Returns `None` if the ring cannot be initialized.
    pub fn shared_instance() -> Option<&'static IoRing> {
        let ring = SHARED.get_or_init(|| IoRing::with_config(RingConfig::from_env()));
        ring.ensure_initialized().then_some(ring)
    }

    /// The configuration this ring was built with
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Bring up the backend if that has not happened yet.
    ///
    /// Returns false if it cannot be brought up; a later call tries again.
    pub fn ensure_initialized(&self) -> bool {
        self.lock_state().initialize(&self.config)
    }

    /// Which backend runs requests, once initialized
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.lock_state().backend.as_ref().map(|b| b.kind())
    }

    /// Whether requests of `operation` can be executed. False if the ring cannot initialize.
    pub fn supports_operation(&self, operation: Operation) -> bool {
        let mut state = self.lock_state();
        state.initialize(&self.config)
            && state
                .backend
                .as_ref()
                .is_some_and(|b| b.supports(operation))
    }

    /// Submission queue entries: the allocated count once initialized, the requested one before
    pub fn submission_queue_size(&self) -> u32 {
        self.lock_state()
            .backend
            .as_ref()
            .map_or(self.config.submission_queue_size, |b| {
                b.submission_queue_size()
            })
    }

    /// Completion queue entries: the allocated count once initialized, the requested one before
    pub fn completion_queue_size(&self) -> u32 {
        self.lock_state()
            .backend
            .as_ref()
            .map_or(self.config.completion_queue_size, |b| {
                b.completion_queue_size()
            })
    }

    /// Requests queued whose callbacks have not yet finished
    pub fn in_flight(&self) -> usize {
        self.lock_state().requests.len()
    }

    /// Whether `handle` names a request whose callback has not yet finished
    pub fn is_pending(&self, handle: RequestHandle) -> bool {
        self.lock_state().requests.contains(handle)
    }

    /// Queue a request and return its handle.
    ///
    /// Never fails. Requests that cannot run (ring unavailable, unsupported operation, invalid
    /// arguments, oversized transfers) complete with a [`FileError`] delivered through the
    /// callback on the next drain, like any other completion.
    pub fn queue_request<Op: IoOperation>(&self, request: Request<Op>) -> RequestHandle {
        let mut state = self.lock_state();
        let ready = state.initialize(&self.config);
        let handle = state.requests.insert(Pending::new(Op::into_any(request)));
        debug!(?handle, operation = %Op::OPERATION, "queued request");

        if !ready {
            state.finish_now(handle, FileError::Resource);
            return handle;
        }
        if !state
            .backend
            .as_ref()
            .is_some_and(|b| b.supports(Op::OPERATION))
        {
            state.finish_now(handle, FileError::Unsupported);
            state.wake_poller();
            return handle;
        }

        if Op::OPERATION == Operation::Cancel {
            state.backlog.push_front(handle);
        } else {
            state.backlog.push_back(handle);
        }
        state.stage();
        if self.config.eager_submit {
            state.submit();
        }
        // A poller sleeping on the backend only notices work the backend reports.
        if !state.ready.is_empty() || !self.config.eager_submit {
            state.wake_poller();
        }
        handle
    }

    /// Push every staged request to the kernel.
    ///
    /// Only needed with [`RingConfig::eager_submit`] disabled; waits and drains also submit.
    pub fn submit_requests(&self) {
        let mut state = self.lock_state();
        state.stage();
        state.submit();
    }

    /// Block until the callback of `handle` has run, or until `timeout` passes.
    ///
    /// Returns true once the request is done, including when `handle` never named a request
    /// or was already retired; false on timeout. `None` waits indefinitely. Completions of
    /// other requests are dispatched along the way. Must not be called from a callback; doing
    /// so returns false at once.
    pub fn wait_for_request(&self, handle: RequestHandle, timeout: Option<Duration>) -> bool {
        if IN_CALLBACK.get() {
            warn!(?handle, "wait_for_request called from a request callback");
            return false;
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);

        let mut state = self.lock_state();
        loop {
            if !state.requests.contains(handle) {
                return true;
            }

            if state.polling {
                state = match deadline {
                    None => self
                        .retired
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return false;
                        }
                        self.retired
                            .wait_timeout(state, deadline - now)
                            .map(|(guard, _)| guard)
                            .unwrap_or_else(|e| e.into_inner().0)
                    }
                };
                continue;
            }

            let batch = state.collect();
            if !batch.is_empty() {
                state = self.run_batch(state, batch);
                continue;
            }
            if expired() {
                return false;
            }
            let Some(wakeup) = state.wakeup.clone() else {
                // No backend: nothing further can complete.
                return false;
            };

            state.polling = true;
            drop(state);
            trace!(?handle, "polling for completions");
            wakeup.wait(deadline);
            state = self.lock_state();
            state.polling = false;
            self.retired.notify_all();
        }
    }

    /// Dispatch every completion available right now without blocking.
    ///
    /// Returns the number of callbacks run. Returns 0 if another thread is currently
    /// polling; that thread dispatches instead.
    pub fn drain(&self) -> usize {
        if IN_CALLBACK.get() {
            return 0;
        }
        let mut state = self.lock_state();
        if state.polling {
            return 0;
        }
        let batch = state.collect();
        let count = batch.len();
        if count > 0 {
            drop(self.run_batch(state, batch));
        }
        count
    }

    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run callbacks with the lock released, then retire their handles
    fn run_batch<'a>(
        &'a self,
        mut state: MutexGuard<'a, RingState>,
        batch: Batch,
    ) -> MutexGuard<'a, RingState> {
        state.polling = true;
        drop(state);

        let (handles, panicked) = dispatch(batch);

        let mut state = self.lock_state();
        for handle in handles {
            state.requests.remove(handle);
        }
        state.polling = false;
        self.retired.notify_all();

        if let Some(payload) = panicked {
            drop(state);
            panic::resume_unwind(payload);
        }
        state
    }
}

impl Drop for IoRing {
    /// Requests that never reached the backend complete with [`FileError::Aborted`]. Those
    /// with the backend are asked to cancel and then waited for, so one that can never
    /// finish on its own, such as a read from an idle pipe, also ends up aborted. Every
    /// callback runs before the ring is gone.
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if state.requests.is_empty() {
            return;
        }
        debug!(outstanding = state.requests.len(), "draining ring before drop");
        state.closing = true;
        state.stage();
        state.cancel_in_flight();
        state.submit();

        loop {
            let batch = state.collect();
            if batch.is_empty() {
                if state.requests.is_empty() || state.in_flight == 0 {
                    break;
                }
                match state.wakeup.as_ref() {
                    Some(wakeup) => {
                        wakeup.wait(None);
                    }
                    None => break,
                }
                continue;
            }

            let (handles, panicked) = dispatch(batch);
            for handle in handles {
                state.requests.remove(handle);
            }
            if panicked.is_some() {
                error!("request callback panicked while the ring was dropped");
            }
        }

        if !state.requests.is_empty() {
            warn!(
                leaked = state.requests.len(),
                "ring dropped with undeliverable requests"
            );
        }
    }
}

impl std::fmt::Debug for IoRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRing")
            .field("config", &self.config)
            .field("backend", &self.backend_kind())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl RingState {
    fn initialize(&mut self, config: &RingConfig) -> bool {
        if self.backend.is_some() {
            return true;
        }
        match backend::create(config) {
            Ok(backend) => {
                debug!(
                    kind = %backend.kind(),
                    sq_entries = backend.submission_queue_size(),
                    cq_entries = backend.completion_queue_size(),
                    "ring initialized"
                );
                self.wakeup = Some(backend.wakeup());
                self.backend = Some(backend);
                true
            }
            Err(e) => {
                warn!("failed to initialize ring: {}", e);
                false
            }
        }
    }

    /// Settle a request without the backend
    fn finish_now(&mut self, handle: RequestHandle, error: FileError) {
        if let Some(pending) = self.requests.get_mut(handle) {
            pending.fail(error);
            pending.stage = Stage::Ready;
            self.ready.push(handle);
        }
    }

    /// Wake a poller sleeping on the backend so it notices requests settled without it
    fn wake_poller(&self) {
        if !self.polling {
            return;
        }
        if let Some(wakeup) = &self.wakeup {
            wakeup.notify();
        }
    }

    /// Move backlog entries to the backend while flow control allows
    fn stage(&mut self) {
        if self.closing {
            while let Some(handle) = self.backlog.pop_front() {
                self.abort(handle);
            }
            return;
        }
        let Some(cq_limit) = self.backend.as_ref().map(|b| b.completion_queue_size()) else {
            return;
        };

        while let Some(&handle) = self.backlog.front() {
            let Some(pending) = self.requests.get_mut(handle) else {
                self.backlog.pop_front();
                continue;
            };
            let operation = pending.operation();
            let blocked = self.flush_in_flight
                || self.in_flight >= cq_limit
                || (operation.is_barrier() && self.partial > 0);

            let entry = if let Some(target) = pending.cancel_target() {
                // Cancels of requests the backend has not seen settle without it.
                if blocked && self.stage_of(target) == Some(Stage::InFlight) {
                    break;
                }
                match self.resolve_cancel(handle, target) {
                    Some(entry) => entry,
                    None => continue,
                }
            } else {
                if blocked {
                    break;
                }
                match pending.prepare() {
                    Prepared::Submit(entry) => entry,
                    Prepared::Done => {
                        if pending.is_partial() {
                            self.partial -= 1;
                        }
                        self.backlog.pop_front();
                        pending.stage = Stage::Ready;
                        self.ready.push(handle);
                        continue;
                    }
                }
            };

            let submission = Submission {
                user_data: handle.to_user_data(),
                entry,
                drain: operation.is_barrier(),
            };
            let Some(backend) = self.backend.as_mut() else {
                return;
            };
            // SAFETY: The entry points into memory owned by the pending request, which stays
            // in the table, unmoved on the heap, until this submission's completion is reaped.
            let mut pushed = unsafe { backend.push(&submission) };
            if !pushed {
                // Submission queue full: hand it to the kernel and retry once.
                if let Err(e) = backend.submit() {
                    warn!("submit failed: {}", e);
                    break;
                }
                pushed = unsafe { backend.push(&submission) };
            }
            if !pushed {
                break;
            }

            trace!(?handle, %operation, "staged");
            self.backlog.pop_front();
            if let Some(pending) = self.requests.get_mut(handle) {
                pending.stage = Stage::InFlight;
            }
            self.in_flight += 1;
            if operation == Operation::Flush {
                self.flush_in_flight = true;
            }
        }
    }

    /// Resolve a cancel at the front of the backlog. Returns the entry to submit when the
    /// target is already with the backend; otherwise settles the cancel and pops it.
    fn resolve_cancel(
        &mut self,
        handle: RequestHandle,
        target: RequestHandle,
    ) -> Option<backend::Entry> {
        let status = match self.stage_of(target) {
            Some(Stage::InFlight) => {
                return Some(backend::Entry::Cancel {
                    target: target.to_user_data(),
                });
            }
            Some(Stage::Backlog) => {
                self.backlog.retain(|&h| h != target);
                self.abort(target);
                CancelStatus::Cancelled
            }
            Some(Stage::Ready | Stage::Dispatching) | None => CancelStatus::NotFound,
        };

        debug!(?handle, ?target, ?status, "cancel resolved without the backend");
        self.backlog.retain(|&h| h != handle);
        if let Some(pending) = self.requests.get_mut(handle) {
            pending.resolve_cancel(status);
            pending.stage = Stage::Ready;
            self.ready.push(handle);
        }
        None
    }

    fn stage_of(&self, handle: RequestHandle) -> Option<Stage> {
        self.requests.get(handle).map(|p| p.stage)
    }

    /// Finish a request that is not with the backend with [`FileError::Aborted`]
    fn abort(&mut self, handle: RequestHandle) {
        if let Some(pending) = self.requests.get_mut(handle) {
            if pending.is_partial() {
                self.partial -= 1;
            }
            pending.fail(FileError::Aborted);
            pending.stage = Stage::Ready;
            self.ready.push(handle);
        }
    }

    /// Push a cancel for every request the backend holds. The cancels' own completions are
    /// counted in `in_flight` and dropped by [`RingState::collect`].
    fn cancel_in_flight(&mut self) {
        let targets: Vec<RequestHandle> = self
            .requests
            .iter()
            .filter(|(_, p)| p.stage == Stage::InFlight && p.operation() != Operation::Cancel)
            .map(|(handle, _)| handle)
            .collect();
        let Some(backend) = self.backend.as_mut() else {
            return;
        };

        for target in targets {
            let submission = Submission {
                user_data: TEARDOWN_CANCEL,
                entry: backend::Entry::Cancel {
                    target: target.to_user_data(),
                },
                drain: false,
            };
            // SAFETY: A cancel entry references no memory.
            let mut pushed = unsafe { backend.push(&submission) };
            if !pushed {
                if let Err(e) = backend.submit() {
                    warn!("submit failed: {}", e);
                    break;
                }
                pushed = unsafe { backend.push(&submission) };
            }
            if !pushed {
                break;
            }
            trace!(?target, "cancel on drop");
            self.in_flight += 1;
        }
    }

    fn submit(&mut self) {
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        if let Err(e) = backend.submit() {
            warn!("submit failed: {}", e);
        }
    }

    /// Reap completions, take every finished request for dispatch, then refill the backend
    fn collect(&mut self) -> Batch {
        let mut completions: Vec<Completion> = Vec::new();
        if let Some(backend) = self.backend.as_mut() {
            backend.reap(&mut completions);
        }

        for completion in completions {
            self.in_flight = self.in_flight.saturating_sub(1);
            if completion.user_data == TEARDOWN_CANCEL {
                continue;
            }
            let handle = RequestHandle::from_user_data(completion.user_data);
            let Some(pending) = self.requests.get_mut(handle) else {
                warn!(?handle, "completion for unknown request");
                continue;
            };
            if pending.operation() == Operation::Flush {
                self.flush_in_flight = false;
            }

            let was_partial = pending.is_partial();
            trace!(?handle, result = completion.result, "completion");
            match pending.complete(completion) {
                Step::Finished => {
                    if was_partial {
                        self.partial -= 1;
                    }
                    pending.stage = Stage::Ready;
                    self.ready.push(handle);
                }
                Step::Continue => {
                    if !was_partial {
                        self.partial += 1;
                    }
                    pending.stage = Stage::Backlog;
                    self.backlog.push_front(handle);
                }
            }
        }

        let mut batch = Vec::with_capacity(self.ready.len());
        for handle in std::mem::take(&mut self.ready) {
            if let Some(request) = self.requests.get_mut(handle).and_then(Pending::take) {
                batch.push((handle, request));
            }
        }

        self.stage();
        self.submit();
        batch
    }
}

/// Run the callbacks of `batch`. A panicking callback does not stop the others; the first
/// panic payload is returned for the caller to resume once bookkeeping is consistent.
fn dispatch(batch: Batch) -> (Vec<RequestHandle>, Option<Box<dyn Any + Send>>) {
    let mut handles = Vec::with_capacity(batch.len());
    let mut panicked = None;

    let outer = IN_CALLBACK.replace(true);
    for (handle, request) in batch {
        trace!(?handle, ?request, "dispatching");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| request.finish())) {
            error!(?handle, "request callback panicked");
            panicked.get_or_insert(payload);
        }
        handles.push(handle);
    }
    IN_CALLBACK.set(outer);

    (handles, panicked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{
        Cancel, Close, Flush, Open, OpenResult, Read, ReadResult, Stat, VectoredRead,
        VectoredWrite, Write, WriteResult,
    };
    use crate::OpenMode;
    use std::io::Write as _;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::NamedTempFile;

    const WAIT: Option<Duration> = Some(Duration::from_secs(10));

    fn emulated(sq: u32, cq: u32) -> IoRing {
        IoRing::with_config(RingConfig {
            backend: BackendKind::Emulated,
            ..RingConfig::with_sizes(sq, cq)
        })
    }

    /// Rings for every backend usable on this host
    fn rings(sq: u32, cq: u32) -> Vec<IoRing> {
        let mut rings = vec![emulated(sq, cq)];
        let uring = IoRing::with_config(RingConfig {
            backend: BackendKind::IoUring,
            ..RingConfig::with_sizes(sq, cq)
        });
        if uring.ensure_initialized() {
            rings.push(uring);
        }
        rings
    }

    fn lorem() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"lorem ipsum").unwrap();
        file
    }

    /// Queue `request` and wait for it, returning the finished request
    fn run<Op: IoOperation>(ring: &IoRing, request: Request<Op>) -> Request<Op> {
        let (tx, rx) = std::sync::mpsc::channel();
        let request = {
            let mut request = request;
            request.set_callback(move |req| tx.send(req).unwrap());
            request
        };
        let handle = ring.queue_request(request);
        assert!(ring.wait_for_request(handle, WAIT));
        rx.try_recv().unwrap()
    }

    #[test]
    fn test_construct() {
        for ring in rings(1, 2) {
            assert!(ring.ensure_initialized());
            assert!(ring.submission_queue_size() >= 1);
            assert!(ring.completion_queue_size() >= 2);
            assert!(ring.supports_operation(Operation::Read));
        }
    }

    #[test]
    fn test_sizes_before_initialization() {
        let ring = emulated(3, 5);
        assert_eq!(ring.backend_kind(), None);
        assert_eq!(ring.submission_queue_size(), 3);
        assert_eq!(ring.completion_queue_size(), 5);
    }

    #[test]
    fn test_invalid_config_fails_requests() {
        let ring = emulated(0, 0);
        assert!(!ring.ensure_initialized());
        assert!(!ring.supports_operation(Operation::Read));

        let req = run(&ring, Request::new(Stat::new(0)));
        assert_eq!(req.result(), Some(&Err(FileError::Resource)));
    }

    #[test]
    fn test_read_lorem_ipsum() {
        let file = lorem();
        for ring in rings(8, 16) {
            let fd = file.as_file().as_raw_fd();
            let req = run(&ring, Request::new(Read::new(fd, 6, vec![0u8; 5])));
            assert_eq!(req.result(), Some(&Ok(ReadResult { bytes_read: 5 })));
            assert_eq!(req.into_op().destination, b"ipsum");
        }
    }

    #[test]
    fn test_open_stat_close() {
        let file = lorem();
        for ring in rings(8, 16) {
            let open = run(
                &ring,
                Request::new(Open::new(file.path(), OpenMode::READ_ONLY)),
            );
            let Some(Ok(OpenResult { fd })) = open.result().copied() else {
                panic!("open failed: {:?}", open.result());
            };

            let stat = run(&ring, Request::new(Stat::new(fd)));
            let result = stat.result().unwrap().unwrap();
            assert_eq!(result.size, 11);
            assert!(result.is_file());

            let close = run(&ring, Request::new(Close::new(fd)));
            assert_eq!(close.result(), Some(&Ok(())));
        }
    }

    #[test]
    fn test_open_existing_only_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        for ring in rings(8, 16) {
            let path = dir.path().join("missing");
            let req = run(
                &ring,
                Request::new(Open::new(
                    &path,
                    OpenMode::READ_WRITE | OpenMode::EXISTING_ONLY,
                )),
            );
            assert_eq!(req.result(), Some(&Err(FileError::NotFound)));
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_write_flush_read_roundtrip() {
        for ring in rings(8, 16) {
            let file = NamedTempFile::new().unwrap();
            let fd = file.as_file().as_raw_fd();
            let data: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

            let write = run(&ring, Request::new(Write::new(fd, 0, data.clone())));
            assert_eq!(
                write.result(),
                Some(&Ok(WriteResult {
                    bytes_written: data.len() as u64
                }))
            );
            let flush = run(&ring, Request::new(Flush::new(fd)));
            assert_eq!(flush.result(), Some(&Ok(())));

            let read = run(&ring, Request::new(Read::new(fd, 0, vec![0u8; data.len()])));
            assert_eq!(
                read.result(),
                Some(&Ok(ReadResult {
                    bytes_read: data.len() as u64
                }))
            );
            assert!(read.into_op().destination == data);
        }
    }

    #[test]
    fn test_vectored_roundtrip() {
        for ring in rings(8, 16) {
            let file = NamedTempFile::new().unwrap();
            let fd = file.as_file().as_raw_fd();
            let sources: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 4096]).collect();

            let write = run(&ring, Request::new(VectoredWrite::new(fd, 0, sources.clone())));
            assert_eq!(
                write.result(),
                Some(&Ok(WriteResult {
                    bytes_written: 16 * 4096
                }))
            );

            let read = run(
                &ring,
                Request::new(VectoredRead::new(fd, 0, vec![vec![0u8; 4096]; 16])),
            );
            assert_eq!(
                read.result(),
                Some(&Ok(ReadResult {
                    bytes_read: 16 * 4096
                }))
            );
            assert_eq!(read.into_op().destinations, sources);
        }
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let file = lorem();
        for ring in rings(8, 16) {
            let fd = file.as_file().as_raw_fd();
            let req = run(&ring, Request::new(Read::new(fd, 6, vec![0u8; 64])));
            assert_eq!(req.result(), Some(&Ok(ReadResult { bytes_read: 5 })));
        }
    }

    #[test]
    fn test_zero_length_and_bad_fd() {
        for ring in rings(8, 16) {
            let req = run(&ring, Request::new(Read::new(0, 0, Vec::new())));
            assert_eq!(req.result(), Some(&Ok(ReadResult { bytes_read: 0 })));

            let req = run(&ring, Request::new(Flush::new(-1)));
            assert_eq!(req.result(), Some(&Err(FileError::BadDescriptor)));

            let req = run(&ring, Request::new(Write::new(-5, 0, vec![1])));
            assert_eq!(req.result(), Some(&Err(FileError::BadDescriptor)));
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_oversized_read_fails() {
        let file = lorem();
        let ring = emulated(8, 16);
        // Untouched zeroed pages are never faulted in.
        let limit = crate::MAX_RW_COUNT;
        let buffer = vec![0u8; limit as usize + 1];
        let req = run(
            &ring,
            Request::new(Read::new(file.as_file().as_raw_fd(), 0, buffer)),
        );
        assert_eq!(
            req.result(),
            Some(&Err(FileError::TransferTooLarge {
                requested: limit + 1,
                limit,
            }))
        );
    }

    #[test]
    fn test_cancel_unknown_handle() {
        for ring in rings(8, 16) {
            let bogus = RequestHandle::new(1000, 7);
            let req = run(&ring, Request::new(Cancel::new(bogus)));
            assert_eq!(req.result(), Some(&Ok(CancelStatus::NotFound)));
        }
    }

    #[test]
    fn test_cancel_backlogged_request() {
        let file = lorem();
        let fd = file.as_file().as_raw_fd();
        let ring = IoRing::with_config(RingConfig {
            backend: BackendKind::Emulated,
            eager_submit: false,
            ..RingConfig::with_sizes(1, 1)
        });

        // One completion slot: the first read holds it, the second waits in the backlog.
        let first = ring.queue_request(Request::new(Read::new(fd, 0, vec![0u8; 5])));
        let aborted = Arc::new(AtomicUsize::new(0));
        let seen = aborted.clone();
        let second = ring.queue_request(Request::new(Read::new(fd, 0, vec![0u8; 5])).with_callback(
            move |req| {
                assert_eq!(req.result(), Some(&Err(FileError::Aborted)));
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let cancel = run(&ring, Request::new(Cancel::new(second)));
        assert_eq!(cancel.result(), Some(&Ok(CancelStatus::Cancelled)));
        assert!(ring.wait_for_request(second, WAIT));
        assert!(ring.wait_for_request(first, WAIT));
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn test_wait_on_retired_handle_returns_immediately() {
        let ring = emulated(8, 16);
        let handle = ring.queue_request(Request::new(Flush::new(-1)));
        assert!(ring.wait_for_request(handle, WAIT));
        assert!(!ring.is_pending(handle));
        assert!(ring.wait_for_request(handle, Some(Duration::ZERO)));
    }

    #[test]
    fn test_zero_timeout_on_unsubmitted_request() {
        let file = lorem();
        let ring = IoRing::with_config(RingConfig {
            backend: BackendKind::Emulated,
            eager_submit: false,
            ..RingConfig::with_sizes(1, 1)
        });
        let fd = file.as_file().as_raw_fd();
        let _first = ring.queue_request(Request::new(Read::new(fd, 0, vec![0u8; 1])));
        let second = ring.queue_request(Request::new(Read::new(fd, 0, vec![0u8; 1])));

        // Nothing has completed yet, so a zero timeout gives up after one pass.
        assert!(!ring.wait_for_request(second, Some(Duration::ZERO)));
        assert!(ring.is_pending(second));
        assert!(ring.wait_for_request(second, WAIT));
    }

    #[test]
    fn test_deferred_submission() {
        let file = lorem();
        let ring = IoRing::with_config(RingConfig {
            backend: BackendKind::Emulated,
            eager_submit: false,
            ..RingConfig::with_sizes(8, 16)
        });
        let fd = file.as_file().as_raw_fd();
        let handle = ring.queue_request(Request::new(Read::new(fd, 0, vec![0u8; 5])));

        assert_eq!(ring.drain(), 0);
        ring.submit_requests();
        assert_eq!(ring.drain(), 1);
        assert!(!ring.is_pending(handle));
    }

    #[test]
    fn test_callbacks_can_queue_requests() {
        let file = lorem();
        let fd = file.as_file().as_raw_fd();
        let ring = Arc::new(emulated(8, 16));
        let (tx, rx) = std::sync::mpsc::channel();

        let inner_ring = ring.clone();
        let handle = ring.queue_request(Request::new(Read::new(fd, 0, vec![0u8; 5])).with_callback(
            move |req| {
                let offset = req.result().unwrap().unwrap().bytes_read + 1;
                let next = inner_ring.queue_request(
                    Request::new(Read::new(fd, offset, vec![0u8; 5]))
                        .with_callback(move |req| tx.send(req.into_op().destination).unwrap()),
                );
                // Blocking from a callback is refused rather than deadlocking.
                assert!(!inner_ring.wait_for_request(next, WAIT));
            },
        ));

        assert!(ring.wait_for_request(handle, WAIT));
        while ring.in_flight() > 0 {
            ring.drain();
        }
        assert_eq!(rx.recv().unwrap(), b"ipsum");
    }

    #[test]
    fn test_drop_fires_all_callbacks() {
        let file = lorem();
        let fd = file.as_file().as_raw_fd();
        let fired = Arc::new(AtomicUsize::new(0));

        for ring in rings(2, 2) {
            fired.store(0, Ordering::SeqCst);
            for _ in 0..10 {
                let fired = fired.clone();
                ring.queue_request(Request::new(Read::new(fd, 0, vec![0u8; 11])).with_callback(
                    move |req| {
                        assert!(matches!(
                            req.result(),
                            Some(Ok(_)) | Some(Err(FileError::Aborted))
                        ));
                        fired.fetch_add(1, Ordering::SeqCst);
                    },
                ));
            }
            drop(ring);
            assert_eq!(fired.load(Ordering::SeqCst), 10);
        }
    }

    #[test]
    fn test_drop_cancels_request_that_never_completes() {
        let ring = IoRing::with_config(RingConfig {
            backend: BackendKind::IoUring,
            ..RingConfig::with_sizes(4, 8)
        });
        if !ring.ensure_initialized() {
            return;
        }

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (tx, rx) = std::sync::mpsc::channel();
        // Nothing is ever written to the pipe.
        ring.queue_request(
            Request::new(Read::new(fds[0], 0, vec![0u8; 16]))
                .with_callback(move |req| tx.send(req.result().cloned()).unwrap()),
        );
        ring.submit_requests();
        assert_eq!(ring.in_flight(), 1);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            drop(ring);
            done_tx.send(()).unwrap();
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());
        assert_eq!(rx.recv().unwrap(), Some(Err(FileError::Aborted)));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_backlog_beyond_completion_budget() {
        let file = lorem();
        let fd = file.as_file().as_raw_fd();
        for ring in rings(2, 2) {
            let fired = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..64)
                .map(|i| {
                    let fired = fired.clone();
                    ring.queue_request(
                        Request::new(Read::new(fd, i % 11, vec![0u8; 1])).with_callback(move |req| {
                            assert_eq!(req.result(), Some(&Ok(ReadResult { bytes_read: 1 })));
                            fired.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                })
                .collect();

            for handle in handles {
                assert!(ring.wait_for_request(handle, WAIT));
            }
            assert_eq!(fired.load(Ordering::SeqCst), 64);
            assert_eq!(ring.in_flight(), 0);
        }
    }

    #[test]
    fn test_concurrent_waiters() {
        let file = lorem();
        let fd = file.as_file().as_raw_fd();
        for ring in rings(4, 8) {
            let ring = Arc::new(ring);
            let fired = Arc::new(AtomicUsize::new(0));

            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let ring = ring.clone();
                    let fired = fired.clone();
                    thread::spawn(move || {
                        for _ in 0..50 {
                            let fired = fired.clone();
                            let handle = ring.queue_request(
                                Request::new(Read::new(fd, 6, vec![0u8; 5])).with_callback(
                                    move |req| {
                                        assert_eq!(req.into_op().destination, b"ipsum");
                                        fired.fetch_add(1, Ordering::SeqCst);
                                    },
                                ),
                            );
                            assert!(ring.wait_for_request(handle, WAIT));
                        }
                    })
                })
                .collect();

            for worker in workers {
                worker.join().unwrap();
            }
            assert_eq!(fired.load(Ordering::SeqCst), 400);
        }
    }

    #[test]
    fn test_callback_panic_propagates_after_bookkeeping() {
        let ring = emulated(8, 16);
        let handle = ring.queue_request(
            Request::new(Flush::new(-1)).with_callback(|_| panic!("callback failure")),
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| ring.wait_for_request(handle, WAIT)));
        assert!(result.is_err());
        assert!(!ring.is_pending(handle));
        assert!(ring.wait_for_request(handle, Some(Duration::ZERO)));
    }

    #[test]
    fn test_shared_instance_is_singleton() {
        let a = IoRing::shared_instance().unwrap();
        let b = IoRing::shared_instance().unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(a.submission_queue_size() >= crate::DEFAULT_SUBMISSION_QUEUE_SIZE);
        assert!(a.completion_queue_size() >= crate::DEFAULT_COMPLETION_QUEUE_SIZE);
    }
}
