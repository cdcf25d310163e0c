//! File operations driven through the ring.
//!
//! Transfers keep several block-sized reads in flight; copies turn each finished read into a
//! write at the same offset, so reads and writes overlap.

use crate::config::TransferConfig;
use crate::progress::CopyProgress;
use anyhow::{Context, anyhow, bail};
use ioring::{
    Close, FileError, Flush, IoOperation, IoRing, Open, OpenMode, Read, Request, RequestHandle,
    Stat, StatResult, Write, WriteResult,
};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};

/// Queue one request and block until it finishes, returning its parameters and payload
pub fn execute<Op: IoOperation>(ring: &IoRing, op: Op) -> anyhow::Result<(Op, Op::Output)> {
    let (tx, rx) = mpsc::channel();
    let handle = ring.queue_request(Request::new(op).with_callback(move |req| {
        let _ = tx.send(req.into_parts());
    }));
    ring.wait_for_request(handle, None);

    let (op, result) = rx
        .recv()
        .context("request finished without running its callback")?;
    let output = result.ok_or_else(|| anyhow!("request finished without a result"))??;
    Ok((op, output))
}

/// A descriptor opened through the ring, closed through it on drop
pub struct RingFile<'a> {
    ring: &'a IoRing,
    fd: Option<RawFd>,
}

impl<'a> RingFile<'a> {
    /// Open `path` with `mode`
    ///
    /// # Errors
    ///
    /// Returns an error if the open request fails.
    pub fn open(ring: &'a IoRing, path: &Path, mode: OpenMode) -> anyhow::Result<Self> {
        let (_, opened) = execute(ring, Open::new(path, mode))
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            ring,
            fd: Some(opened.fd),
        })
    }

    /// The raw descriptor
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.unwrap_or(-1)
    }

    /// Query metadata
    ///
    /// # Errors
    ///
    /// Returns an error if the stat request fails.
    pub fn stat(&self) -> anyhow::Result<StatResult> {
        let (_, stat) = execute(self.ring, Stat::new(self.fd()))?;
        Ok(stat)
    }

    /// Flush data and metadata to storage
    ///
    /// # Errors
    ///
    /// Returns an error if the flush request fails.
    pub fn flush(&self) -> anyhow::Result<()> {
        execute(self.ring, Flush::new(self.fd()))?;
        Ok(())
    }

    /// Close the descriptor, reporting failure
    ///
    /// # Errors
    ///
    /// Returns an error if the close request fails.
    pub fn close(mut self) -> anyhow::Result<()> {
        match self.fd.take() {
            Some(fd) => {
                execute(self.ring, Close::new(fd))?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for RingFile<'_> {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            if let Err(e) = execute(self.ring, Close::new(fd)) {
                tracing::warn!(fd, "close failed: {}", e);
            }
        }
    }
}

enum Event {
    Read(Request<Read>),
    Written(Option<Result<WriteResult, FileError>>),
}

/// Keeps up to `depth` block reads of a source file in flight
struct Pump<'a> {
    ring: &'a IoRing,
    fd: RawFd,
    size: u64,
    block: u64,
    depth: usize,
    next_offset: u64,
    in_flight: usize,
    handles: VecDeque<RequestHandle>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl<'a> Pump<'a> {
    fn new(ring: &'a IoRing, fd: RawFd, size: u64, config: &TransferConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            ring,
            fd,
            size,
            block: config.block_size as u64,
            depth: config.queue_depth,
            next_offset: 0,
            in_flight: 0,
            handles: VecDeque::new(),
            tx,
            rx,
        }
    }

    /// Queue reads until the pipeline is full or the file is covered
    fn fill(&mut self) {
        while self.in_flight < self.depth && self.next_offset < self.size {
            let len = self.block.min(self.size - self.next_offset);
            let tx = self.tx.clone();
            let request = Request::new(Read::new(self.fd, self.next_offset, vec![0u8; len as usize]))
                .with_callback(move |req| {
                    let _ = tx.send(Event::Read(req));
                });
            self.handles.push_back(self.ring.queue_request(request));
            self.in_flight += 1;
            self.next_offset += len;
        }
    }

    fn write(&mut self, fd: RawFd, offset: u64, data: Vec<u8>) {
        let tx = self.tx.clone();
        let request = Request::new(Write::new(fd, offset, data)).with_callback(move |mut req| {
            let _ = tx.send(Event::Written(req.take_result()));
        });
        self.handles.push_back(self.ring.queue_request(request));
        self.in_flight += 1;
    }

    /// Block until at least one request has finished and return what finished
    fn next_events(&mut self) -> anyhow::Result<Vec<Event>> {
        loop {
            let handle = self
                .handles
                .pop_front()
                .ok_or_else(|| anyhow!("transfer stalled with nothing in flight"))?;
            self.ring.wait_for_request(handle, None);

            let events: Vec<Event> = self.rx.try_iter().collect();
            if !events.is_empty() {
                self.in_flight -= events.len();
                return Ok(events);
            }
        }
    }
}

/// Unpack a finished block read, rejecting short reads
fn read_chunk(req: Request<Read>) -> anyhow::Result<(u64, Vec<u8>)> {
    let (op, result) = req.into_parts();
    let res = result.ok_or_else(|| anyhow!("read finished without a result"))?;
    let bytes_read = res.with_context(|| format!("read at offset {} failed", op.offset))?.bytes_read;
    if bytes_read < op.destination.len() as u64 {
        bail!("source shrank during transfer (offset {})", op.offset + bytes_read);
    }
    Ok((op.offset, op.destination))
}

/// Copy `source` to `destination`, returning bytes copied
///
/// # Errors
///
/// Returns an error if any request fails or the source changes size mid-copy.
pub fn copy(
    ring: &IoRing,
    source: &Path,
    destination: &Path,
    config: &TransferConfig,
    show_progress: bool,
) -> anyhow::Result<u64> {
    let src = RingFile::open(ring, source, OpenMode::READ_ONLY)?;
    let dst = RingFile::open(ring, destination, OpenMode::WRITE_ONLY | OpenMode::TRUNCATE)?;
    let size = src.stat()?.size;
    tracing::debug!(size, block = config.block_size, depth = config.queue_depth, "copy");

    let name = source.display().to_string();
    let progress = CopyProgress::new(size, &name, show_progress);
    let mut pump = Pump::new(ring, src.fd(), size, config);
    let mut copied = 0u64;

    let result = (|| -> anyhow::Result<()> {
        while copied < size {
            pump.fill();
            for event in pump.next_events()? {
                match event {
                    Event::Read(req) => {
                        let (offset, data) = read_chunk(req)?;
                        pump.write(dst.fd(), offset, data);
                    }
                    Event::Written(result) => {
                        let written = result
                            .ok_or_else(|| anyhow!("write finished without a result"))?
                            .context("write failed")?;
                        copied += written.bytes_written;
                        progress.advance(written.bytes_written);
                    }
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        progress.fail();
        return Err(e);
    }
    progress.finish();

    if config.flush {
        dst.flush()?;
    }
    dst.close()?;
    src.close()?;
    Ok(copied)
}

/// Write the contents of `path` to `out`, returning bytes written
///
/// # Errors
///
/// Returns an error if any request fails or writing to `out` fails.
pub fn cat(
    ring: &IoRing,
    path: &Path,
    out: &mut impl io::Write,
    config: &TransferConfig,
) -> anyhow::Result<u64> {
    let file = RingFile::open(ring, path, OpenMode::READ_ONLY)?;
    let size = file.stat()?.size;

    let mut pump = Pump::new(ring, file.fd(), size, config);
    // Reads finish in any order; hold blocks until everything before them is out.
    let mut held: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
    let mut emitted = 0u64;

    while emitted < size {
        pump.fill();
        for event in pump.next_events()? {
            if let Event::Read(req) = event {
                let (offset, data) = read_chunk(req)?;
                held.insert(offset, data);
            }
        }
        while let Some(data) = held.remove(&emitted) {
            out.write_all(&data)?;
            emitted += data.len() as u64;
        }
    }
    out.flush()?;

    file.close()?;
    Ok(emitted)
}
