use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chunklog::{
    BytesRecord, CHUNK_HEADER_SIZE, Chunk, ChunkConfig, ChunkError, RecordLayout,
    read_bytes_record,
};
use tempfile::TempDir;

fn uncached_config() -> ChunkConfig {
    ChunkConfig {
        layout: RecordLayout::Variable { data_size: 8192 },
        max_log_record_size: 128,
        chunk_reader_count: 2,
        message_chunk_cache_max_percent: 0,
        force_cache_chunk: false,
    }
}

fn forced_config() -> ChunkConfig {
    ChunkConfig {
        force_cache_chunk: true,
        ..uncached_config()
    }
}

fn fill_chunk(chunk: &Arc<Chunk>, count: u8) -> Vec<u64> {
    let mut data_positions = Vec::new();
    for index in 0..count {
        let payload = vec![index; usize::from(index % 32) + 1];
        let result = chunk.try_append(&BytesRecord(payload)).expect("append");
        let position = result.position().expect("success");
        data_positions.push(position - chunk.data_start_position());
    }
    data_positions
}

fn read_all(chunk: &Arc<Chunk>, data_positions: &[u64]) -> Vec<Vec<u8>> {
    data_positions
        .iter()
        .map(|position| {
            chunk
                .try_read_at(*position, read_bytes_record)
                .expect("read")
                .0
        })
        .collect()
}

#[test]
fn cached_reads_match_file_reads() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");

    let chunk = Chunk::create_new(&path, 0, uncached_config(), false).expect("create");
    let data_positions = fill_chunk(&chunk, 100);
    chunk.complete().expect("complete");
    chunk.close().expect("close");
    drop(chunk);

    // A zero-budget view keeps serving from the file.
    let file_view = Chunk::from_completed_file(&path, uncached_config(), false).expect("reopen");
    let from_file = read_all(&file_view, &data_positions);
    assert!(!file_view.is_cached());
    assert!(!file_view.uncache_from_memory().expect("nothing to uncache"));

    let cached_view = Chunk::from_completed_file(&path, forced_config(), false).expect("reopen");
    assert!(cached_view.try_cache_in_memory().expect("cache"));
    assert!(cached_view.is_cached());
    assert!(!cached_view.try_cache_in_memory().expect("already cached"));

    let from_memory = read_all(&cached_view, &data_positions);
    assert_eq!(from_file, from_memory);

    assert!(cached_view.uncache_from_memory().expect("uncache"));
    assert!(!cached_view.is_cached());
}

#[test]
fn budget_of_zero_refuses_caching() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");
    let chunk = Chunk::create_new(&path, 0, uncached_config(), false).expect("create");
    fill_chunk(&chunk, 4);
    chunk.complete().expect("complete");

    assert!(!chunk.try_cache_in_memory().expect("denied"));
    assert!(!chunk.is_cached());
}

#[test]
fn forced_cache_dual_writes_from_creation() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");

    let chunk = Chunk::create_new(&path, 0, forced_config(), false).expect("create");
    assert!(chunk.is_cached());

    let data_positions = fill_chunk(&chunk, 20);
    let from_memory = read_all(&chunk, &data_positions);

    // The file carries the same committed bytes as the memory twin.
    chunk.flush().expect("flush");
    let bytes = std::fs::read(&path).expect("read file");
    let h = CHUNK_HEADER_SIZE as usize;
    assert_eq!(&bytes[h..h + 4], &1u32.to_le_bytes());
    assert_eq!(bytes[h + 4], 0);
    assert_eq!(&bytes[h + 5..h + 9], &1u32.to_le_bytes());

    chunk.complete().expect("complete");
    assert!(chunk.is_cached());
    assert_eq!(read_all(&chunk, &data_positions), from_memory);

    assert!(chunk.uncache_from_memory().expect("uncache"));
    assert_eq!(read_all(&chunk, &data_positions), from_memory);
}

#[test]
fn ongoing_reopen_with_forced_cache_mirrors_existing_records() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");

    let chunk = Chunk::create_new(&path, 0, uncached_config(), false).expect("create");
    let mut data_positions = fill_chunk(&chunk, 2);
    chunk.flush().expect("flush");
    chunk.close().expect("close");
    drop(chunk);

    let reopened =
        Chunk::from_ongoing_file(&path, forced_config(), read_bytes_record, false)
            .expect("recover");
    assert!(reopened.is_cached());
    let before = read_all(&reopened, &data_positions);

    let result = reopened
        .try_append(&BytesRecord(vec![0x5A; 7]))
        .expect("append");
    data_positions.push(result.position().expect("success") - reopened.data_start_position());

    reopened.complete().expect("complete");
    let after = read_all(&reopened, &data_positions);
    assert_eq!(&after[..before.len()], before.as_slice());
    assert_eq!(after.last().expect("last"), &vec![0x5A; 7]);

    assert!(reopened.uncache_from_memory().expect("uncache"));
    assert_eq!(read_all(&reopened, &data_positions), after);
}

#[test]
fn memory_chunks_never_touch_the_file_and_refuse_delete() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");

    let chunk = Chunk::create_new(&path, 0, uncached_config(), true).expect("create");
    assert!(chunk.is_memory());
    assert!(!path.exists());

    let data_positions = fill_chunk(&chunk, 8);
    assert_eq!(read_all(&chunk, &data_positions).len(), 8);
    chunk.complete().expect("complete");
    assert!(!path.exists());

    assert!(matches!(chunk.delete(), Err(ChunkError::InvalidState(_))));
    assert!(!chunk.try_cache_in_memory().expect("refuse"));
}

#[test]
fn read_path_schedules_opportunistic_caching() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");

    let chunk = Chunk::create_new(&path, 0, uncached_config(), false).expect("create");
    let data_positions = fill_chunk(&chunk, 4);
    chunk.complete().expect("complete");
    chunk.close().expect("close");
    drop(chunk);

    let reopened = Chunk::from_completed_file(&path, forced_config(), false).expect("reopen");
    assert!(!reopened.is_cached());
    reopened
        .try_read_at(data_positions[0], read_bytes_record)
        .expect("read");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !reopened.is_cached() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(reopened.is_cached());
}

#[test]
fn delete_while_reading_fails_cleanly() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");

    let chunk = Chunk::create_new(&path, 0, uncached_config(), false).expect("create");
    fill_chunk(&chunk, 50);
    chunk.complete().expect("complete");

    // Prove at least one read succeeds before the delete starts.
    chunk.try_read_at(0, read_bytes_record).expect("read");

    let reader_chunk = Arc::clone(&chunk);
    let reader = thread::spawn(move || {
        let mut successful = 0usize;
        loop {
            match reader_chunk.try_read_at(0, read_bytes_record) {
                Ok(_) => successful += 1,
                Err(ChunkError::InvalidRead(_)) => return successful,
                Err(err) => panic!("unexpected read failure: {err}"),
            }
        }
    });

    thread::sleep(Duration::from_millis(50));
    chunk.delete().expect("delete");
    assert!(!path.exists());
    assert!(chunk.is_deleting());
    assert!(matches!(
        chunk.try_read_at(0, read_bytes_record),
        Err(ChunkError::InvalidRead(_))
    ));

    // The reader observed the delete as a clean read failure, never a hang.
    reader.join().expect("reader thread");
}
