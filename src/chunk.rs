//! The chunk controller.
//!
//! A `Chunk` is one fixed-size append-only file plus an optional in-memory
//! twin. It owns the on-disk lifecycle (create, reopen, append, flush,
//! complete, delete), serves point reads by data position through a pooled
//! set of read handles, and mirrors itself into memory when the memory
//! budget allows so reads never touch the file.
//!
//! Concurrency model: a single writer serialised by the write lock, up to
//! `chunk_reader_count` concurrent readers, and lock-free publication of
//! `data_position` so readers observe either the pre-append state or the
//! fully committed record.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;
use scopeguard::defer;
use tracing::{debug, warn};

use crate::buffer::ChunkBuf;
use crate::config::{ChunkConfig, RecordLayout};
use crate::error::{ChunkError, ChunkResult};
use crate::format::{
    CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE, ChunkFooter, ChunkHeader, RECORD_FRAME_OVERHEAD,
};
use crate::fs::{TempFileGuard, chunk_temp_path, create_fixed_size_file, fsync_dir, set_read_only};
use crate::memory::{admit_chunk_cache, system};
use crate::reader::ReaderPool;
use crate::record::{LogRecord, RecordWriteResult};
use crate::writer::WriterContext;

/// How long `delete` and `close` wait for in-flight readers to return their
/// handles before abandoning them.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const COPY_CHUNK_BYTES: usize = 1024 * 1024;

/// Point-in-time view of a chunk's state for managers and metric layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStatus {
    pub chunk_number: u32,
    pub data_position: u64,
    pub is_completed: bool,
    pub is_deleting: bool,
    pub is_cached: bool,
    pub is_memory: bool,
    pub last_active_age_ms: u64,
}

pub struct Chunk {
    path: PathBuf,
    header: ChunkHeader,
    config: ChunkConfig,

    /// Bytes of committed data, excluding the header. Written only under the
    /// write lock, read without locking by readers.
    data_position: AtomicU64,
    completed: AtomicBool,
    deleting: AtomicBool,
    caching_in_progress: AtomicBool,
    last_active_unix_ms: AtomicU64,

    footer: Mutex<Option<ChunkFooter>>,
    writer: Mutex<Option<WriterContext>>,
    readers: ReaderPool,

    cache_sync: Mutex<()>,
    mirror: ArcSwapOption<Chunk>,

    /// Owning handle of the unmanaged buffer; present iff this chunk is
    /// itself the memory twin. Released exactly once when the last clone
    /// (writer, pooled readers) drops.
    cached_data: Option<Arc<ChunkBuf>>,
}

impl Chunk {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Creates a brand-new chunk at `path`, preallocated to its full size.
    ///
    /// The file is materialised through a sibling temp file that is fully
    /// written, synced, and atomically renamed into place. With
    /// `is_memory`, no file is touched and the chunk lives entirely in an
    /// owned buffer.
    pub fn create_new(
        path: impl Into<PathBuf>,
        chunk_number: u32,
        config: ChunkConfig,
        is_memory: bool,
    ) -> ChunkResult<Arc<Self>> {
        let path = path.into();
        let config = config.validated()?;
        let header = ChunkHeader::new(chunk_number, config.data_total_size());

        if is_memory {
            return Self::memory_chunk_new(path, header, config);
        }

        if path.exists() {
            return Err(ChunkError::invalid_state(format!(
                "chunk file already exists: {}",
                path.display()
            )));
        }

        let temp = TempFileGuard::new(chunk_temp_path(&path));
        {
            let mut file = create_fixed_size_file(temp.path(), total_file_size(&header))?;
            file.write_all(&header.to_bytes())?;
            file.sync_all()?;
        }
        fs::rename(temp.path(), &path)?;
        temp.commit();
        if let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }

        let writer = WriterContext::for_file(open_rw(&path)?, u64::from(CHUNK_HEADER_SIZE))?;
        let readers = ReaderPool::for_file(&path, config.chunk_reader_count)?;
        let chunk = Arc::new(Self::assemble(
            path, header, config, None, Some(writer), readers, 0, false, None,
        ));
        chunk.attach_construction_mirror(|| {
            Self::memory_chunk_new(chunk.path.clone(), header, config)
        });
        debug!(chunk = chunk_number, "created new chunk");
        Ok(chunk)
    }

    /// Opens a completed chunk, validating header, footer, and file length.
    ///
    /// With `is_memory`, the entire file is loaded into a freshly allocated
    /// buffer and reads are served from it.
    pub fn from_completed_file(
        path: impl Into<PathBuf>,
        config: ChunkConfig,
        is_memory: bool,
    ) -> ChunkResult<Arc<Self>> {
        let path = path.into();
        let config = config.validated()?;

        let mut file = open_existing(&path)?;
        let file_len = file.metadata()?.len();
        let header = read_header(&mut file, file_len, &path)?;
        check_header_config(&header, &config, &path)?;

        if file_len < u64::from(CHUNK_HEADER_SIZE) + u64::from(CHUNK_FOOTER_SIZE) {
            return Err(ChunkError::bad_chunk(format!(
                "{}: completed chunk shorter than header and footer",
                path.display()
            )));
        }
        file.seek(SeekFrom::End(-i64::from(CHUNK_FOOTER_SIZE)))?;
        let mut footer_buf = [0u8; CHUNK_FOOTER_SIZE as usize];
        file.read_exact(&mut footer_buf)?;
        let footer = ChunkFooter::from_file_bytes(&footer_buf, &path)?;

        if footer.chunk_number != header.chunk_number {
            return Err(ChunkError::bad_chunk(format!(
                "{}: footer chunk number {} does not match header {}",
                path.display(),
                footer.chunk_number,
                header.chunk_number
            )));
        }
        let data_size = u64::from(footer.chunk_data_total_size);
        let expected_len = u64::from(CHUNK_HEADER_SIZE) + data_size + u64::from(CHUNK_FOOTER_SIZE);
        if file_len != expected_len {
            return Err(ChunkError::bad_chunk(format!(
                "{}: file length {file_len} does not match footer-derived {expected_len}",
                path.display()
            )));
        }
        if config.layout.is_fixed() && footer.chunk_data_total_size != header.chunk_data_total_size
        {
            return Err(ChunkError::bad_chunk(format!(
                "{}: fixed chunk completed with {} of {} data bytes",
                path.display(),
                footer.chunk_data_total_size,
                header.chunk_data_total_size
            )));
        }

        let chunk = if is_memory {
            let buf = ChunkBuf::new_zeroed(file_len as usize)?;
            file.seek(SeekFrom::Start(0))?;
            copy_stream_into_buf(&mut file, &buf, 0, file_len as usize)?;
            let readers = ReaderPool::for_memory(&buf, config.chunk_reader_count)?;
            Self::assemble(
                path,
                header,
                config,
                Some(buf),
                None,
                readers,
                data_size,
                true,
                Some(footer),
            )
        } else {
            let readers = ReaderPool::for_file(&path, config.chunk_reader_count)?;
            Self::assemble(
                path,
                header,
                config,
                None,
                None,
                readers,
                data_size,
                true,
                Some(footer),
            )
        };
        debug!(
            chunk = header.chunk_number,
            data_position = data_size,
            is_memory,
            "opened completed chunk"
        );
        Ok(Arc::new(chunk))
    }

    /// Re-opens a chunk that was still accepting appends when the process
    /// stopped, recovering `data_position` by scanning valid records.
    ///
    /// Each scan step is a guarded probe: any I/O error, invalid length,
    /// prefix/suffix mismatch, or `None` from `read_record` ends the scan at
    /// the last good position. Trailing garbage is left in place and simply
    /// overwritten by subsequent appends.
    pub fn from_ongoing_file<R, F>(
        path: impl Into<PathBuf>,
        config: ChunkConfig,
        mut read_record: F,
        is_memory: bool,
    ) -> ChunkResult<Arc<Self>>
    where
        F: FnMut(u32, &mut dyn Read) -> io::Result<Option<R>>,
    {
        let path = path.into();
        let config = config.validated()?;

        let file = open_existing(&path)?;
        let file_len = file.metadata()?.len();
        let mut scan = BufReader::new(file);
        let header = read_header(&mut scan, file_len, &path)?;
        check_header_config(&header, &config, &path)?;

        let data_position = scan_ongoing(&mut scan, file_len, &config, &mut read_record)?;
        drop(scan);

        let chunk = if is_memory {
            Self::memory_chunk_ongoing(path, header, config, data_position)?
        } else {
            let writer = WriterContext::for_file(
                open_rw(&path)?,
                u64::from(CHUNK_HEADER_SIZE) + data_position,
            )?;
            let readers = ReaderPool::for_file(&path, config.chunk_reader_count)?;
            let chunk = Arc::new(Self::assemble(
                path,
                header,
                config,
                None,
                Some(writer),
                readers,
                data_position,
                false,
                None,
            ));
            chunk.attach_construction_mirror(|| {
                Self::memory_chunk_ongoing(chunk.path.clone(), header, config, data_position)
            });
            chunk
        };
        debug!(
            chunk = header.chunk_number,
            data_position, "recovered ongoing chunk"
        );
        Ok(chunk)
    }

    /// Fresh memory chunk: zeroed buffer with the header written in.
    fn memory_chunk_new(
        path: PathBuf,
        header: ChunkHeader,
        config: ChunkConfig,
    ) -> ChunkResult<Arc<Self>> {
        let buf = ChunkBuf::new_zeroed(total_file_size(&header) as usize)?;
        buf.write_bytes(0, &header.to_bytes())?;
        let writer = WriterContext::for_memory(Arc::clone(&buf), u64::from(CHUNK_HEADER_SIZE));
        let readers = ReaderPool::for_memory(&buf, config.chunk_reader_count)?;
        Ok(Arc::new(Self::assemble(
            path,
            header,
            config,
            Some(buf),
            Some(writer),
            readers,
            0,
            false,
            None,
        )))
    }

    /// Memory chunk for an ongoing file: header plus the committed bytes
    /// `[H, H + data_position)` copied from the file.
    fn memory_chunk_ongoing(
        path: PathBuf,
        header: ChunkHeader,
        config: ChunkConfig,
        data_position: u64,
    ) -> ChunkResult<Arc<Self>> {
        let buf = ChunkBuf::new_zeroed(total_file_size(&header) as usize)?;
        buf.write_bytes(0, &header.to_bytes())?;
        if data_position > 0 {
            let mut file = open_existing(&path)?;
            file.seek(SeekFrom::Start(u64::from(CHUNK_HEADER_SIZE)))?;
            copy_stream_into_buf(
                &mut file,
                &buf,
                CHUNK_HEADER_SIZE as usize,
                data_position as usize,
            )?;
        }
        let writer = WriterContext::for_memory(
            Arc::clone(&buf),
            u64::from(CHUNK_HEADER_SIZE) + data_position,
        );
        let readers = ReaderPool::for_memory(&buf, config.chunk_reader_count)?;
        Ok(Arc::new(Self::assemble(
            path,
            header,
            config,
            Some(buf),
            Some(writer),
            readers,
            data_position,
            false,
            None,
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        path: PathBuf,
        header: ChunkHeader,
        config: ChunkConfig,
        cached_data: Option<Arc<ChunkBuf>>,
        writer: Option<WriterContext>,
        readers: ReaderPool,
        data_position: u64,
        completed: bool,
        footer: Option<ChunkFooter>,
    ) -> Self {
        Self {
            path,
            header,
            config,
            data_position: AtomicU64::new(data_position),
            completed: AtomicBool::new(completed),
            deleting: AtomicBool::new(false),
            caching_in_progress: AtomicBool::new(false),
            last_active_unix_ms: AtomicU64::new(now_millis()),
            footer: Mutex::new(footer),
            writer: Mutex::new(writer),
            readers,
            cache_sync: Mutex::new(()),
            mirror: ArcSwapOption::from(None),
            cached_data,
        }
    }

    /// Builds and attaches the memory twin at construction time when the
    /// memory budget admits it. Failures are logged and the chunk proceeds
    /// uncached.
    fn attach_construction_mirror<F>(&self, build: F)
    where
        F: FnOnce() -> ChunkResult<Arc<Chunk>>,
    {
        if self.is_memory() {
            return;
        }
        let size_mb = size_in_mb(total_file_size(&self.header));
        if !admit_chunk_cache(
            system(),
            size_mb,
            self.config.message_chunk_cache_max_percent,
            self.config.force_cache_chunk,
        ) {
            debug!(
                chunk = self.header.chunk_number,
                size_mb, "memory budget denied chunk caching at construction"
            );
            return;
        }
        match build() {
            Ok(mirror) => {
                self.mirror.store(Some(mirror));
                debug!(chunk = self.header.chunk_number, "chunk cached in memory");
            }
            Err(err) => {
                warn!(
                    chunk = self.header.chunk_number,
                    error = %err,
                    "building memory chunk failed; continuing uncached"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Append path
    // ------------------------------------------------------------------

    /// Appends one record, returning its global position or `NotEnoughSpace`
    /// when the data region cannot hold it.
    pub fn try_append<R>(&self, record: &R) -> ChunkResult<RecordWriteResult>
    where
        R: LogRecord + ?Sized,
    {
        if self.completed.load(Ordering::Acquire) {
            return Err(ChunkError::chunk_write(
                self.header.chunk_number,
                "cannot append to a completed chunk",
            ));
        }

        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| ChunkError::invalid_state("chunk writer is closed"))?;
        let data_end =
            u64::from(CHUNK_HEADER_SIZE) + u64::from(self.header.chunk_data_total_size);
        let data_position = writer.position() - u64::from(CHUNK_HEADER_SIZE);
        let global_position = self.header.data_start_position() + data_position;

        match self.config.layout {
            RecordLayout::Fixed { unit_size, .. } => {
                if writer.position() + u64::from(unit_size) > data_end {
                    return Ok(RecordWriteResult::NotEnoughSpace);
                }
                let scratch = writer.scratch_mut();
                scratch.clear();
                record.write_to(global_position, scratch)?;
                if scratch.len() != unit_size as usize {
                    let written = scratch.len();
                    return Err(ChunkError::chunk_write(
                        self.header.chunk_number,
                        format!("fixed record framed {written} bytes, expected {unit_size}"),
                    ));
                }
                writer.append_scratch()?;
            }
            RecordLayout::Variable { .. } => {
                let max_record = self.config.max_log_record_size;
                let scratch = writer.scratch_mut();
                scratch.clear();
                scratch.extend_from_slice(&[0u8; 4]);
                record.write_to(global_position, scratch)?;
                let record_length = scratch.len() - 4;
                if record_length == 0 {
                    return Err(ChunkError::chunk_write(
                        self.header.chunk_number,
                        "record framed no payload bytes",
                    ));
                }
                if record_length > max_record as usize {
                    return Err(ChunkError::chunk_write(
                        self.header.chunk_number,
                        format!(
                            "record length {record_length} exceeds max_log_record_size {max_record}"
                        ),
                    ));
                }
                let length = record_length as u32;
                scratch.extend_from_slice(&length.to_le_bytes());
                scratch[0..4].copy_from_slice(&length.to_le_bytes());
                if writer.position() + record_length as u64 + u64::from(RECORD_FRAME_OVERHEAD)
                    > data_end
                {
                    return Ok(RecordWriteResult::NotEnoughSpace);
                }
                writer.append_scratch()?;
            }
        }

        let new_data_position = writer.position() - u64::from(CHUNK_HEADER_SIZE);
        self.data_position
            .store(new_data_position, Ordering::Release);

        // Dual-write into the memory twin; any divergence is an invariant
        // break, not a recoverable condition.
        if let Some(mirror) = self.mirror.load_full() {
            match mirror.try_append(record)? {
                RecordWriteResult::Success { position } if position == global_position => {}
                RecordWriteResult::Success { position } => {
                    return Err(ChunkError::chunk_write(
                        self.header.chunk_number,
                        format!(
                            "memory chunk committed at {position}, file chunk at {global_position}"
                        ),
                    ));
                }
                RecordWriteResult::NotEnoughSpace => {
                    return Err(ChunkError::chunk_write(
                        self.header.chunk_number,
                        "memory chunk ran out of space before the file chunk",
                    ));
                }
            }
        }

        self.touch();
        Ok(RecordWriteResult::Success {
            position: global_position,
        })
    }

    /// Syncs appended bytes to stable storage. Idempotent; a no-op once the
    /// writer is gone.
    pub fn flush(&self) -> ChunkResult<()> {
        let guard = self.writer.lock();
        if let Some(writer) = guard.as_ref() {
            writer.flush_to_disk()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Reads the record at `data_position`.
    ///
    /// Served from the memory twin when one is attached. Any inconsistency
    /// (out-of-range position, bad length, prefix/suffix mismatch, factory
    /// returning `None` or consuming the wrong number of bytes) raises
    /// `InvalidRead` and is a corruption signal, never silently recovered.
    pub fn try_read_at<R, F>(self: &Arc<Self>, data_position: u64, read_record: F) -> ChunkResult<R>
    where
        F: FnOnce(u32, &mut dyn Read) -> io::Result<Option<R>>,
    {
        if let Some(mirror) = self.mirror.load_full() {
            return mirror.try_read_at(data_position, read_record);
        }
        if self.deleting.load(Ordering::Acquire) {
            return Err(ChunkError::invalid_read(format!(
                "chunk {} is being deleted",
                self.header.chunk_number
            )));
        }
        self.maybe_schedule_cache();

        let current = self.data_position.load(Ordering::Acquire);
        if data_position >= current {
            return Err(ChunkError::invalid_read(format!(
                "data position {data_position} is not below written position {current}"
            )));
        }

        let mut reader = self.readers.acquire()?;
        reader.seek(SeekFrom::Start(
            u64::from(CHUNK_HEADER_SIZE) + data_position,
        ))?;

        let record = match self.config.layout {
            RecordLayout::Variable { .. } => {
                let length = reader.read_u32::<LittleEndian>().map_err(|err| {
                    ChunkError::invalid_read(format!(
                        "reading length prefix at {data_position} failed: {err}"
                    ))
                })?;
                if length == 0 || length > self.config.max_log_record_size {
                    return Err(ChunkError::invalid_read(format!(
                        "record length {length} out of bounds at data position {data_position}"
                    )));
                }
                if data_position + u64::from(length) + u64::from(RECORD_FRAME_OVERHEAD) > current {
                    return Err(ChunkError::invalid_read(format!(
                        "record at {data_position} extends past written position {current}"
                    )));
                }
                let record = run_record_factory(&mut reader, length, data_position, read_record)?;
                let suffix = reader.read_u32::<LittleEndian>().map_err(|err| {
                    ChunkError::invalid_read(format!(
                        "reading length suffix at {data_position} failed: {err}"
                    ))
                })?;
                if suffix != length {
                    return Err(ChunkError::invalid_read(format!(
                        "length suffix {suffix} does not match prefix {length} at {data_position}"
                    )));
                }
                record
            }
            RecordLayout::Fixed { unit_size, .. } => {
                if data_position + u64::from(unit_size) > current {
                    return Err(ChunkError::invalid_read(format!(
                        "record at {data_position} extends past written position {current}"
                    )));
                }
                run_record_factory(&mut reader, unit_size, data_position, read_record)?
            }
        };

        drop(reader);
        self.touch();
        Ok(record)
    }

    /// Schedules a single-flight background `try_cache_in_memory` for a
    /// completed file chunk that is not yet mirrored.
    fn maybe_schedule_cache(self: &Arc<Self>) {
        if self.is_memory()
            || !self.completed.load(Ordering::Acquire)
            || self.deleting.load(Ordering::Acquire)
        {
            return;
        }
        // A zero budget without forcing can never be admitted; skip the
        // thread spawn instead of retrying on every read.
        if self.config.message_chunk_cache_max_percent == 0 && !self.config.force_cache_chunk {
            return;
        }
        if self
            .caching_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let chunk = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("chunk-cache".to_string())
            .spawn(move || {
                if let Err(err) = chunk.try_cache_in_memory() {
                    warn!(
                        chunk = chunk.header.chunk_number,
                        error = %err,
                        "opportunistic memory caching failed"
                    );
                }
            });
        if let Err(err) = spawned {
            self.caching_in_progress.store(false, Ordering::Release);
            warn!(
                chunk = self.header.chunk_number,
                error = %err,
                "failed to spawn caching thread"
            );
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Seals the chunk with a footer, truncates unused preallocated space,
    /// and retires the writer. Idempotent.
    pub fn complete(&self) -> ChunkResult<()> {
        let mut guard = self.writer.lock();
        if self.completed.load(Ordering::Acquire) {
            return Ok(());
        }
        let writer = guard
            .as_mut()
            .ok_or_else(|| ChunkError::invalid_state("chunk writer is closed"))?;
        let data_position = writer.position() - u64::from(CHUNK_HEADER_SIZE);

        if self.config.layout.is_fixed()
            && data_position != u64::from(self.header.chunk_data_total_size)
        {
            return Err(ChunkError::chunk_complete(
                self.header.chunk_number,
                format!(
                    "fixed chunk holds {data_position} of {} data bytes",
                    self.header.chunk_data_total_size
                ),
            ));
        }

        let footer = ChunkFooter::new(self.header.chunk_number, data_position as u32);
        writer.append(&footer.to_bytes())?;
        writer.flush_to_disk()?;

        if !self.is_memory() {
            let target_len = u64::from(CHUNK_HEADER_SIZE)
                + data_position
                + u64::from(CHUNK_FOOTER_SIZE);
            if writer.stream_len()? != target_len {
                writer.resize(target_len)?;
                writer.flush_to_disk()?;
            }
        }

        *guard = None;
        *self.footer.lock() = Some(footer);
        self.completed.store(true, Ordering::Release);
        drop(guard);

        if !self.is_memory() {
            if let Err(err) = set_read_only(&self.path, true) {
                warn!(
                    chunk = self.header.chunk_number,
                    error = %err,
                    "failed to mark completed chunk read-only"
                );
            }
        }
        if let Some(mirror) = self.mirror.load_full() {
            mirror.complete()?;
        }

        self.touch();
        debug!(
            chunk = self.header.chunk_number,
            data_position, "chunk completed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory mirroring
    // ------------------------------------------------------------------

    /// Mirrors a completed file chunk into memory if the budget admits it.
    ///
    /// Returns whether a mirror is attached after the call. Refusals and
    /// load failures are logged and reported as `Ok(false)`; the chunk keeps
    /// serving reads from the file.
    pub fn try_cache_in_memory(&self) -> ChunkResult<bool> {
        let _cache = self.cache_sync.lock();
        defer! {
            self.caching_in_progress.store(false, Ordering::Release);
        }

        if self.is_memory()
            || !self.completed.load(Ordering::Acquire)
            || self.deleting.load(Ordering::Acquire)
            || self.mirror.load_full().is_some()
        {
            return Ok(false);
        }

        let data_position = self.data_position.load(Ordering::Acquire);
        let size_mb = size_in_mb(
            u64::from(CHUNK_HEADER_SIZE) + data_position + u64::from(CHUNK_FOOTER_SIZE),
        );
        if !admit_chunk_cache(
            system(),
            size_mb,
            self.config.message_chunk_cache_max_percent,
            self.config.force_cache_chunk,
        ) {
            debug!(
                chunk = self.header.chunk_number,
                size_mb, "memory budget denied chunk caching"
            );
            return Ok(false);
        }

        match Self::from_completed_file(self.path.clone(), self.config, true) {
            Ok(mirror) => {
                self.mirror.store(Some(mirror));
                debug!(chunk = self.header.chunk_number, "chunk cached in memory");
                Ok(true)
            }
            Err(err) => {
                warn!(
                    chunk = self.header.chunk_number,
                    error = %err,
                    "caching chunk in memory failed"
                );
                Ok(false)
            }
        }
    }

    /// Detaches and disposes the memory twin. Returns whether one was
    /// attached.
    pub fn uncache_from_memory(&self) -> ChunkResult<bool> {
        let _cache = self.cache_sync.lock();
        if self.is_memory() {
            return Ok(false);
        }
        match self.mirror.swap(None) {
            Some(mirror) => {
                mirror.close()?;
                debug!(chunk = self.header.chunk_number, "chunk uncached");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Removes the chunk file. Only completed file chunks can be deleted;
    /// readers in flight fail cleanly on their next acquire.
    pub fn delete(&self) -> ChunkResult<()> {
        if self.is_memory() {
            return Err(ChunkError::invalid_state("memory chunks cannot be deleted"));
        }
        if !self.completed.load(Ordering::Acquire) {
            return Err(ChunkError::invalid_state(
                "only completed chunks can be deleted",
            ));
        }
        self.deleting.store(true, Ordering::Release);

        if let Some(mirror) = self.mirror.swap(None) {
            if let Err(err) = mirror.close() {
                warn!(
                    chunk = self.header.chunk_number,
                    error = %err,
                    "closing memory chunk during delete failed"
                );
            }
        }
        self.readers.drain(READER_DRAIN_TIMEOUT);

        if let Err(err) = set_read_only(&self.path, false) {
            warn!(
                chunk = self.header.chunk_number,
                error = %err,
                "failed to clear read-only attribute before delete"
            );
        }
        fs::remove_file(&self.path)?;
        debug!(chunk = self.header.chunk_number, "chunk deleted");
        Ok(())
    }

    /// Flushes an ongoing writer, drains the reader pool, and releases the
    /// memory twin. Idempotent.
    pub fn close(&self) -> ChunkResult<()> {
        {
            let mut guard = self.writer.lock();
            if let Some(writer) = guard.as_ref() {
                writer.flush_to_disk()?;
            }
            *guard = None;
        }
        self.readers.drain(READER_DRAIN_TIMEOUT);
        if let Some(mirror) = self.mirror.swap(None) {
            mirror.close()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn chunk_number(&self) -> u32 {
        self.header.chunk_number
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    #[inline]
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        *self.footer.lock()
    }

    /// Bytes of committed data, excluding the header.
    #[inline]
    pub fn data_position(&self) -> u64 {
        self.data_position.load(Ordering::Acquire)
    }

    /// First global position addressed by this chunk.
    #[inline]
    pub fn data_start_position(&self) -> u64 {
        self.header.data_start_position()
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_memory(&self) -> bool {
        self.cached_data.is_some()
    }

    #[inline]
    pub fn is_cached(&self) -> bool {
        self.mirror.load_full().is_some()
    }

    /// Whether the data region is filled to capacity.
    pub fn is_full(&self) -> bool {
        self.data_position() >= u64::from(self.header.chunk_data_total_size)
    }

    pub fn status(&self) -> ChunkStatus {
        ChunkStatus {
            chunk_number: self.header.chunk_number,
            data_position: self.data_position(),
            is_completed: self.is_completed(),
            is_deleting: self.is_deleting(),
            is_cached: self.is_cached(),
            is_memory: self.is_memory(),
            last_active_age_ms: now_millis()
                .saturating_sub(self.last_active_unix_ms.load(Ordering::Acquire)),
        }
    }

    fn touch(&self) {
        self.last_active_unix_ms.store(now_millis(), Ordering::Release);
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let mut guard = self.writer.lock();
        if let Some(writer) = guard.take() {
            if let Err(err) = writer.flush_to_disk() {
                warn!(
                    chunk = self.header.chunk_number,
                    error = %err,
                    "flushing chunk writer on drop failed"
                );
            }
        }
    }
}

// ----------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------

/// Full on-disk size of a chunk file: header, data region, footer slot.
fn total_file_size(header: &ChunkHeader) -> u64 {
    u64::from(CHUNK_HEADER_SIZE)
        + u64::from(header.chunk_data_total_size)
        + u64::from(CHUNK_FOOTER_SIZE)
}

fn size_in_mb(bytes: u64) -> u64 {
    bytes.div_ceil(1024 * 1024)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn open_existing(path: &Path) -> ChunkResult<File> {
    File::open(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ChunkError::file_not_exist(path.display())
        } else {
            err.into()
        }
    })
}

fn read_header(reader: &mut impl Read, file_len: u64, path: &Path) -> ChunkResult<ChunkHeader> {
    if file_len < u64::from(CHUNK_HEADER_SIZE) {
        return Err(ChunkError::bad_chunk(format!(
            "{}: file shorter than chunk header",
            path.display()
        )));
    }
    let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
    reader.read_exact(&mut buf)?;
    ChunkHeader::from_file_bytes(&buf, path)
}

fn check_header_config(
    header: &ChunkHeader,
    config: &ChunkConfig,
    path: &Path,
) -> ChunkResult<()> {
    if header.chunk_data_total_size != config.data_total_size() {
        return Err(ChunkError::bad_chunk(format!(
            "{}: header data size {} does not match configured {}",
            path.display(),
            header.chunk_data_total_size,
            config.data_total_size()
        )));
    }
    Ok(())
}

/// Invokes the caller's `read_record` factory over a length-bounded view of
/// the reader and enforces exact consumption.
fn run_record_factory<S, R, F>(
    source: &mut S,
    length: u32,
    data_position: u64,
    read_record: F,
) -> ChunkResult<R>
where
    S: Read,
    F: FnOnce(u32, &mut dyn Read) -> io::Result<Option<R>>,
{
    let mut limited = Read::take(source, u64::from(length));
    let record = read_record(length, &mut limited)
        .map_err(|err| {
            ChunkError::invalid_read(format!(
                "record factory failed at data position {data_position}: {err}"
            ))
        })?
        .ok_or_else(|| {
            ChunkError::invalid_read(format!(
                "record factory returned no record at data position {data_position}"
            ))
        })?;
    if limited.limit() != 0 {
        let consumed = u64::from(length) - limited.limit();
        return Err(ChunkError::invalid_read(format!(
            "record factory consumed {consumed} of {length} bytes at data position {data_position}"
        )));
    }
    Ok(record)
}

/// Recovers the committed byte count of an ongoing chunk by probing records
/// from the reader, which must be positioned just past the header.
fn scan_ongoing<S, R, F>(
    reader: &mut S,
    file_len: u64,
    config: &ChunkConfig,
    read_record: &mut F,
) -> ChunkResult<u64>
where
    S: Read,
    F: FnMut(u32, &mut dyn Read) -> io::Result<Option<R>>,
{
    let bound = file_len.saturating_sub(u64::from(CHUNK_FOOTER_SIZE));
    let mut position = u64::from(CHUNK_HEADER_SIZE);

    match config.layout {
        RecordLayout::Fixed { unit_size, .. } => loop {
            if position + u64::from(unit_size) > bound {
                break;
            }
            if !probe_record(reader, unit_size, read_record) {
                break;
            }
            position += u64::from(unit_size);
        },
        RecordLayout::Variable { .. } => loop {
            if position + 4 > bound {
                break;
            }
            let length = match reader.read_u32::<LittleEndian>() {
                Ok(length) => length,
                Err(_) => break,
            };
            if length == 0 || length > config.max_log_record_size {
                break;
            }
            if position + u64::from(RECORD_FRAME_OVERHEAD) + u64::from(length) > bound {
                break;
            }
            if !probe_record(reader, length, read_record) {
                break;
            }
            match reader.read_u32::<LittleEndian>() {
                Ok(suffix) if suffix == length => {}
                _ => break,
            }
            position += u64::from(RECORD_FRAME_OVERHEAD) + u64::from(length);
        },
    }

    Ok(position - u64::from(CHUNK_HEADER_SIZE))
}

/// One guarded probe: true only if the factory produced a record and
/// consumed exactly `length` bytes.
fn probe_record<S, R, F>(reader: &mut S, length: u32, read_record: &mut F) -> bool
where
    S: Read,
    F: FnMut(u32, &mut dyn Read) -> io::Result<Option<R>>,
{
    let mut limited = Read::take(reader, u64::from(length));
    matches!(read_record(length, &mut limited), Ok(Some(_)) if limited.limit() == 0)
}

fn copy_stream_into_buf(
    source: &mut impl Read,
    buf: &Arc<ChunkBuf>,
    mut offset: usize,
    mut remaining: usize,
) -> ChunkResult<()> {
    let mut scratch = vec![0u8; COPY_CHUNK_BYTES.min(remaining.max(1))];
    while remaining > 0 {
        let want = scratch.len().min(remaining);
        let read = source.read(&mut scratch[..want])?;
        if read == 0 {
            return Err(ChunkError::bad_chunk(
                "chunk file ended while loading into memory",
            ));
        }
        buf.write_bytes(offset, &scratch[..read])?;
        offset += read;
        remaining -= read;
    }
    Ok(())
}
