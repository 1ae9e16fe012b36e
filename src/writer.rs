//! Single-owner append context for a chunk.
//!
//! Exactly one `WriterContext` exists per chunk while it is ongoing; every
//! mutation goes through the chunk's write lock. The context tracks the
//! absolute stream position, frames records through a reusable scratch
//! buffer, and flushes durably for file-backed chunks.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::buffer::ChunkBuf;
use crate::error::ChunkResult;

pub enum WriteBacking {
    File(File),
    Memory(Arc<ChunkBuf>),
}

pub struct WriterContext {
    backing: WriteBacking,
    position: u64,
    scratch: Vec<u8>,
}

impl WriterContext {
    /// Wraps an open chunk file, positioning the cursor at `position`.
    pub fn for_file(mut file: File, position: u64) -> ChunkResult<Self> {
        file.seek(SeekFrom::Start(position))?;
        Ok(Self {
            backing: WriteBacking::File(file),
            position,
            scratch: Vec::new(),
        })
    }

    /// Wraps the memory buffer of a memory chunk.
    pub fn for_memory(buf: Arc<ChunkBuf>, position: u64) -> Self {
        Self {
            backing: WriteBacking::Memory(buf),
            position,
            scratch: Vec::new(),
        }
    }

    /// Absolute stream position of the next append.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Scratch area used to frame one record before it is appended.
    #[inline]
    pub fn scratch_mut(&mut self) -> &mut Vec<u8> {
        &mut self.scratch
    }

    /// Appends the framed scratch contents at the current position.
    pub fn append_scratch(&mut self) -> ChunkResult<u64> {
        match &mut self.backing {
            WriteBacking::File(file) => file.write_all(&self.scratch)?,
            WriteBacking::Memory(buf) => buf.write_bytes(self.position as usize, &self.scratch)?,
        }
        self.position += self.scratch.len() as u64;
        Ok(self.position)
    }

    /// Appends raw bytes (header or footer images) at the current position.
    pub fn append(&mut self, bytes: &[u8]) -> ChunkResult<u64> {
        match &mut self.backing {
            WriteBacking::File(file) => file.write_all(bytes)?,
            WriteBacking::Memory(buf) => buf.write_bytes(self.position as usize, bytes)?,
        }
        self.position += bytes.len() as u64;
        Ok(self.position)
    }

    /// Syncs appended bytes to stable storage. No-op for memory chunks.
    pub fn flush_to_disk(&self) -> ChunkResult<()> {
        match &self.backing {
            WriteBacking::File(file) => match file.sync_data() {
                Ok(()) => Ok(()),
                Err(err) if sync_data_unsupported(&err) => {
                    file.sync_all()?;
                    Ok(())
                }
                Err(err) => Err(err.into()),
            },
            WriteBacking::Memory(_) => Ok(()),
        }
    }

    /// Truncates the underlying file to `len` bytes. Memory chunks are
    /// allocated at their final size and ignore this.
    pub fn resize(&mut self, len: u64) -> ChunkResult<()> {
        if let WriteBacking::File(file) = &mut self.backing {
            file.set_len(len)?;
            if self.position > len {
                self.position = len;
            }
            file.seek(SeekFrom::Start(self.position))?;
        }
        Ok(())
    }

    /// Current length of the backing store.
    pub fn stream_len(&self) -> ChunkResult<u64> {
        match &self.backing {
            WriteBacking::File(file) => Ok(file.metadata()?.len()),
            WriteBacking::Memory(buf) => Ok(buf.capacity() as u64),
        }
    }
}

fn sync_data_unsupported(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::Unsupported) {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        if code == libc::ENOSYS || code == libc::EINVAL || code == libc::ENOTSUP {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Read;
    use tempfile::TempDir;

    fn scratch_writer(tmp: &TempDir) -> (WriterContext, std::path::PathBuf) {
        let path = tmp.path().join("chunk");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .expect("create");
        file.set_len(64).expect("set_len");
        (WriterContext::for_file(file, 8).expect("writer"), path)
    }

    #[test]
    fn file_appends_land_at_the_cursor() {
        let tmp = TempDir::new().expect("tempdir");
        let (mut writer, path) = scratch_writer(&tmp);

        writer.scratch_mut().extend_from_slice(b"abc");
        assert_eq!(writer.append_scratch().expect("append"), 11);
        writer.append(b"XY").expect("append raw");
        writer.flush_to_disk().expect("flush");

        let mut bytes = Vec::new();
        std::fs::File::open(&path)
            .expect("open")
            .read_to_end(&mut bytes)
            .expect("read");
        assert_eq!(&bytes[8..13], b"abcXY");
        assert_eq!(bytes.len(), 64);
    }

    #[test]
    fn resize_truncates_and_clamps_cursor() {
        let tmp = TempDir::new().expect("tempdir");
        let (mut writer, path) = scratch_writer(&tmp);
        writer.append(b"0123456789").expect("append");
        writer.resize(10).expect("resize");
        assert_eq!(writer.position(), 10);
        assert_eq!(writer.stream_len().expect("len"), 10);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), 10);
    }

    #[test]
    fn memory_appends_write_into_the_buffer() {
        let buf = ChunkBuf::new_zeroed(32).expect("alloc");
        let mut writer = WriterContext::for_memory(Arc::clone(&buf), 4);
        writer.scratch_mut().extend_from_slice(b"mem");
        writer.append_scratch().expect("append");
        writer.flush_to_disk().expect("noop flush");
        writer.resize(1).expect("noop resize");
        assert_eq!(writer.position(), 7);
        assert_eq!(buf.read_slice(4..7).expect("read"), b"mem");
    }
}
