//! Bounded pool of seekable read handles shared by reader threads.
//!
//! The pool is filled once at chunk construction with `chunk_reader_count`
//! handles and never grows. `acquire` blocks with a minimal sleep until a
//! handle is free; dropping the returned guard re-enqueues it. Draining the
//! pool waits up to a deadline for outstanding guards to come home; handles
//! still out after the deadline are logged and abandoned to the OS.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use tracing::warn;

use crate::buffer::{BufCursor, ChunkBuf};
use crate::error::{ChunkError, ChunkResult};

const ACQUIRE_RETRY: Duration = Duration::from_millis(1);

/// One pooled random-access view of a chunk's bytes.
pub enum ReadHandle {
    File(File),
    Memory(BufCursor),
}

impl Read for ReadHandle {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHandle::File(file) => file.read(out),
            ReadHandle::Memory(cursor) => cursor.read(out),
        }
    }
}

impl Seek for ReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            ReadHandle::File(file) => file.seek(pos),
            ReadHandle::Memory(cursor) => cursor.seek(pos),
        }
    }
}

pub struct ReaderPool {
    slots: Arc<ArrayQueue<ReadHandle>>,
    issued: usize,
    outstanding: AtomicUsize,
    draining: AtomicBool,
}

impl ReaderPool {
    /// Opens `count` independent read handles on the chunk file.
    pub fn for_file(path: &Path, count: u16) -> ChunkResult<Self> {
        let issued = count.max(1) as usize;
        let slots = Arc::new(ArrayQueue::new(issued));
        for _ in 0..issued {
            let file = OpenOptions::new().read(true).open(path)?;
            slots
                .push(ReadHandle::File(file))
                .map_err(|_| ChunkError::invalid_state("reader pool slot overflow"))?;
        }
        Ok(Self {
            slots,
            issued,
            outstanding: AtomicUsize::new(issued),
            draining: AtomicBool::new(false),
        })
    }

    /// Wraps `count` cursors over the shared memory buffer.
    pub fn for_memory(buf: &Arc<ChunkBuf>, count: u16) -> ChunkResult<Self> {
        let issued = count.max(1) as usize;
        let slots = Arc::new(ArrayQueue::new(issued));
        for _ in 0..issued {
            slots
                .push(ReadHandle::Memory(BufCursor::new(Arc::clone(buf))))
                .map_err(|_| ChunkError::invalid_state("reader pool slot overflow"))?;
        }
        Ok(Self {
            slots,
            issued,
            outstanding: AtomicUsize::new(issued),
            draining: AtomicBool::new(false),
        })
    }

    /// Dequeues a handle, blocking until one is available or the pool drains.
    pub fn acquire(&self) -> ChunkResult<PooledReader> {
        loop {
            if self.draining.load(Ordering::Acquire) {
                return Err(ChunkError::invalid_read("chunk reader pool is draining"));
            }
            if let Some(handle) = self.slots.pop() {
                return Ok(PooledReader {
                    handle: Some(handle),
                    slots: Arc::clone(&self.slots),
                });
            }
            thread::sleep(ACQUIRE_RETRY);
        }
    }

    /// Closes every handle, waiting up to `timeout` for in-flight readers to
    /// return theirs. Handles still out at the deadline are leaked to the OS
    /// so shutdown is never blocked indefinitely; the deficit is logged.
    pub fn drain(&self, timeout: Duration) -> usize {
        self.draining.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let mut reclaimed = 0usize;
        loop {
            while let Some(handle) = self.slots.pop() {
                drop(handle);
                reclaimed += 1;
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
            if self.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    issued = self.issued,
                    leaked = self.outstanding.load(Ordering::Acquire),
                    "reader pool drain timed out; abandoning outstanding handles"
                );
                break;
            }
            thread::sleep(ACQUIRE_RETRY);
        }
        reclaimed
    }

    #[inline]
    pub fn issued(&self) -> usize {
        self.issued
    }
}

/// Guard returned by `acquire`; re-enqueues the handle on drop.
pub struct PooledReader {
    handle: Option<ReadHandle>,
    slots: Arc<ArrayQueue<ReadHandle>>,
}

impl PooledReader {
    #[inline]
    pub fn handle_mut(&mut self) -> &mut ReadHandle {
        self.handle.as_mut().expect("handle present until drop")
    }
}

impl Read for PooledReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.handle_mut().read(out)
    }
}

impl Seek for PooledReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.handle_mut().seek(pos)
    }
}

impl Drop for PooledReader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Queue capacity equals the issued count, so this cannot fail.
            let _ = self.slots.push(handle);
        }
    }
}
