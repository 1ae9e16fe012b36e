//! Bit-exact codecs for the fixed-width structures at the start and end of a
//! chunk file.
//!
//! The on-disk layout is `[header | data region | footer]`, the footer being
//! present only on completed chunks. Both structures are little-endian and
//! zero-padded to their frozen sizes; the sizes are part of the format and
//! must never change.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ChunkError, ChunkResult};

/// Size of the chunk header on disk. Frozen.
pub const CHUNK_HEADER_SIZE: u32 = 128;
/// Size of the chunk footer on disk. Frozen.
pub const CHUNK_FOOTER_SIZE: u32 = 128;

/// Bytes added around a variable-length record: a `u32` length prefix and an
/// identical `u32` length suffix.
pub const RECORD_FRAME_OVERHEAD: u32 = 8;

const HEADER_MAGIC: u32 = 0x4348_4B31; // "CHK1"
const FOOTER_MAGIC: u32 = 0x4348_4B46; // "CHKF"
const FORMAT_VERSION: u16 = 1;

/// Fixed-width record at offset 0 of every chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Monotonic chunk identifier assigned by the caller.
    pub chunk_number: u32,
    /// Planned capacity of the data region in bytes.
    pub chunk_data_total_size: u32,
}

impl ChunkHeader {
    pub fn new(chunk_number: u32, chunk_data_total_size: u32) -> Self {
        Self {
            chunk_number,
            chunk_data_total_size,
        }
    }

    /// First global position addressed by this chunk's data region.
    #[inline]
    pub fn data_start_position(&self) -> u64 {
        u64::from(self.chunk_number) * u64::from(self.chunk_data_total_size)
    }

    /// One past the last global position addressed by this chunk.
    #[inline]
    pub fn data_end_position(&self) -> u64 {
        self.data_start_position() + u64::from(self.chunk_data_total_size)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= CHUNK_HEADER_SIZE as usize);
        buf[..CHUNK_HEADER_SIZE as usize].fill(0);
        LittleEndian::write_u32(&mut buf[0..4], HEADER_MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], FORMAT_VERSION);
        LittleEndian::write_u16(&mut buf[6..8], CHUNK_HEADER_SIZE as u16);
        LittleEndian::write_u32(&mut buf[8..12], self.chunk_number);
        LittleEndian::write_u32(&mut buf[12..16], self.chunk_data_total_size);
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CHUNK_HEADER_SIZE as usize {
            return None;
        }
        if LittleEndian::read_u32(&buf[0..4]) != HEADER_MAGIC {
            return None;
        }
        if LittleEndian::read_u16(&buf[4..6]) != FORMAT_VERSION {
            return None;
        }
        if u32::from(LittleEndian::read_u16(&buf[6..8])) != CHUNK_HEADER_SIZE {
            return None;
        }
        Some(Self {
            chunk_number: LittleEndian::read_u32(&buf[8..12]),
            chunk_data_total_size: LittleEndian::read_u32(&buf[12..16]),
        })
    }

    /// Decodes a header slice read from a file, mapping truncation and codec
    /// failures to `CorruptDatabase`.
    pub fn from_file_bytes(buf: &[u8], path: &std::path::Path) -> ChunkResult<Self> {
        if buf.len() < CHUNK_HEADER_SIZE as usize {
            return Err(ChunkError::bad_chunk(format!(
                "{}: file shorter than chunk header",
                path.display()
            )));
        }
        Self::decode(buf)
            .ok_or_else(|| ChunkError::bad_chunk(format!("{}: invalid chunk header", path.display())))
    }
}

/// Fixed-width record appended after the data region when a chunk completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    /// Repeats the header's chunk number for open-time cross-checking.
    pub chunk_number: u32,
    /// Actual bytes written into the data region at completion.
    pub chunk_data_total_size: u32,
}

impl ChunkFooter {
    pub fn new(chunk_number: u32, chunk_data_total_size: u32) -> Self {
        Self {
            chunk_number,
            chunk_data_total_size,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= CHUNK_FOOTER_SIZE as usize);
        buf[..CHUNK_FOOTER_SIZE as usize].fill(0);
        LittleEndian::write_u32(&mut buf[0..4], FOOTER_MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], FORMAT_VERSION);
        LittleEndian::write_u16(&mut buf[6..8], CHUNK_FOOTER_SIZE as u16);
        LittleEndian::write_u32(&mut buf[8..12], self.chunk_number);
        LittleEndian::write_u32(&mut buf[12..16], self.chunk_data_total_size);
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_FOOTER_SIZE as usize] {
        let mut buf = [0u8; CHUNK_FOOTER_SIZE as usize];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CHUNK_FOOTER_SIZE as usize {
            return None;
        }
        if LittleEndian::read_u32(&buf[0..4]) != FOOTER_MAGIC {
            return None;
        }
        if LittleEndian::read_u16(&buf[4..6]) != FORMAT_VERSION {
            return None;
        }
        if u32::from(LittleEndian::read_u16(&buf[6..8])) != CHUNK_FOOTER_SIZE {
            return None;
        }
        Some(Self {
            chunk_number: LittleEndian::read_u32(&buf[8..12]),
            chunk_data_total_size: LittleEndian::read_u32(&buf[12..16]),
        })
    }

    /// Decodes a footer slice read from a file, mapping truncation and codec
    /// failures to `CorruptDatabase`.
    pub fn from_file_bytes(buf: &[u8], path: &std::path::Path) -> ChunkResult<Self> {
        if buf.len() < CHUNK_FOOTER_SIZE as usize {
            return Err(ChunkError::bad_chunk(format!(
                "{}: file shorter than chunk footer",
                path.display()
            )));
        }
        Self::decode(buf)
            .ok_or_else(|| ChunkError::bad_chunk(format!("{}: invalid chunk footer", path.display())))
    }
}
