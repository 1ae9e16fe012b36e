//! The unmanaged byte buffer backing a memory chunk.
//!
//! `ChunkBuf` owns one raw zeroed allocation holding a byte-identical copy of
//! a chunk file. The single writer only touches offsets at or past the
//! chunk's published data position; readers only touch offsets below it, so
//! the regions handed out never alias a concurrent write. The allocation is
//! released exactly once, on drop.

use std::alloc::{self, Layout};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use crate::error::{ChunkError, ChunkResult};

pub struct ChunkBuf {
    data: NonNull<u8>,
    capacity: usize,
}

unsafe impl Send for ChunkBuf {}
unsafe impl Sync for ChunkBuf {}

impl ChunkBuf {
    /// Allocates a zero-filled buffer of exactly `capacity` bytes.
    pub fn new_zeroed(capacity: usize) -> ChunkResult<Arc<Self>> {
        if capacity == 0 {
            return Err(ChunkError::invalid_config(
                "chunk buffer capacity must be > 0",
            ));
        }
        let layout = Layout::array::<u8>(capacity)
            .map_err(|_| ChunkError::invalid_config("chunk buffer capacity overflows"))?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let data = NonNull::new(raw).ok_or_else(|| {
            ChunkError::invalid_state(format!("chunk buffer allocation of {capacity} bytes failed"))
        })?;
        Ok(Arc::new(Self { data, capacity }))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies `bytes` into the buffer at `offset`. Writer-only.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> ChunkResult<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or_else(|| ChunkError::invalid_state("chunk buffer write offset overflows"))?;
        if end > self.capacity {
            return Err(ChunkError::invalid_state(format!(
                "chunk buffer write past end: {end} > {}",
                self.capacity
            )));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Borrows a committed region of the buffer.
    pub fn read_slice(&self, range: Range<usize>) -> ChunkResult<&[u8]> {
        if range.start > range.end || range.end > self.capacity {
            return Err(ChunkError::invalid_state(format!(
                "chunk buffer read out of range: {}..{} of {}",
                range.start, range.end, self.capacity
            )));
        }
        unsafe {
            Ok(slice::from_raw_parts(
                self.data.as_ptr().add(range.start),
                range.len(),
            ))
        }
    }
}

impl Drop for ChunkBuf {
    fn drop(&mut self) {
        // The layout was validated when the buffer was allocated.
        if let Ok(layout) = Layout::array::<u8>(self.capacity) {
            unsafe {
                alloc::dealloc(self.data.as_ptr(), layout);
            }
        }
    }
}

/// A seekable read cursor over a shared `ChunkBuf`, used by pooled memory
/// read handles and the ongoing-recovery scan.
pub struct BufCursor {
    buf: Arc<ChunkBuf>,
    pos: u64,
}

impl BufCursor {
    pub fn new(buf: Arc<ChunkBuf>) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for BufCursor {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let capacity = self.buf.capacity() as u64;
        if self.pos >= capacity {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = out.len().min((capacity - self.pos) as usize);
        let src = self
            .buf
            .read_slice(start..start + n)
            .map_err(io::Error::other)?;
        out[..n].copy_from_slice(src);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BufCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let capacity = self.buf.capacity() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => capacity + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of chunk buffer",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed_and_writes_read_back() {
        let buf = ChunkBuf::new_zeroed(64).expect("alloc");
        assert_eq!(buf.read_slice(0..64).expect("read"), &[0u8; 64][..]);
        buf.write_bytes(8, b"hello").expect("write");
        assert_eq!(buf.read_slice(8..13).expect("read"), b"hello");
    }

    #[test]
    fn bounds_are_enforced() {
        let buf = ChunkBuf::new_zeroed(16).expect("alloc");
        assert!(buf.write_bytes(12, b"abcde").is_err());
        assert!(buf.read_slice(8..32).is_err());
        assert!(ChunkBuf::new_zeroed(0).is_err());
    }

    #[test]
    fn cursor_reads_and_seeks() {
        let buf = ChunkBuf::new_zeroed(16).expect("alloc");
        buf.write_bytes(0, &[1, 2, 3, 4]).expect("write");

        let mut cursor = BufCursor::new(buf);
        let mut out = [0u8; 2];
        cursor.read_exact(&mut out).expect("read");
        assert_eq!(out, [1, 2]);

        cursor.seek(SeekFrom::Start(3)).expect("seek");
        cursor.read_exact(&mut out[..1]).expect("read");
        assert_eq!(out[0], 4);

        let end = cursor.seek(SeekFrom::End(0)).expect("seek end");
        assert_eq!(end, 16);
        assert_eq!(cursor.read(&mut out).expect("read at end"), 0);
    }
}
