//! Chunked append-only log files: the storage primitive of a message broker.
//!
//! A chunk is a single fixed-size file holding either variable-length
//! framed records or back-to-back fixed-size records, laid out as
//! `[header | data region | footer]` with the footer present only once the
//! chunk is completed. This crate owns the durable lifecycle of one chunk:
//!
//! - **Creation**: preallocated through a temp file and an atomic rename.
//! - **Appending**: a single writer frames records with a length prefix and
//!   identical suffix, accounts for remaining space, and publishes the new
//!   data position atomically.
//! - **Reading**: point reads by data position through a bounded pool of
//!   seekable handles, with prefix/suffix integrity checks.
//! - **Recovery**: ongoing files are re-opened by probing records until the
//!   first inconsistency, resuming appends from the last good byte.
//! - **Memory mirroring**: completed chunks may be twinned into an owned
//!   in-memory buffer when the memory budget allows, after which reads
//!   never touch the file.
//!
//! ## Example
//!
//! ```no_run
//! use chunklog::{BytesRecord, Chunk, ChunkConfig, read_bytes_record};
//!
//! # fn main() -> chunklog::ChunkResult<()> {
//! let chunk = Chunk::create_new("/data/log/chunk-000000", 0, ChunkConfig::default(), false)?;
//! let result = chunk.try_append(&BytesRecord(b"hello".to_vec()))?;
//! if let Some(position) = result.position() {
//!     let start = chunk.data_start_position();
//!     let record = chunk.try_read_at(position - start, read_bytes_record)?;
//!     assert_eq!(record.0, b"hello");
//! }
//! chunk.complete()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread safety
//!
//! Appends, flushes, and completion are serialised by the chunk's write
//! lock; up to `chunk_reader_count` reads run concurrently against the
//! pool. `data_position` is published with release/acquire ordering, so a
//! concurrent read observes either the pre-append state or the fully
//! committed record, never a torn one.

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod format;
pub mod fs;
pub mod memory;
pub mod reader;
pub mod record;
pub mod writer;

pub use chunk::{Chunk, ChunkStatus};
pub use config::{ChunkConfig, RecordLayout};
pub use error::{ChunkError, ChunkResult, CorruptReason};
pub use format::{CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE, ChunkFooter, ChunkHeader};
pub use memory::{MemoryInfo, SystemMemory};
pub use record::{BytesRecord, LogRecord, RecordWriteResult, read_bytes_record};
