use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};

use chunklog::{
    BytesRecord, CHUNK_HEADER_SIZE, Chunk, ChunkConfig, ChunkError, CorruptReason, RecordLayout,
    read_bytes_record,
};
use tempfile::TempDir;

fn variable_config(data_size: u32, max_record: u32) -> ChunkConfig {
    ChunkConfig {
        layout: RecordLayout::Variable { data_size },
        max_log_record_size: max_record,
        chunk_reader_count: 2,
        message_chunk_cache_max_percent: 0,
        force_cache_chunk: false,
    }
}

fn fixed_config(unit_size: u32, count: u32) -> ChunkConfig {
    ChunkConfig {
        layout: RecordLayout::Fixed { unit_size, count },
        max_log_record_size: 512,
        chunk_reader_count: 2,
        message_chunk_cache_max_percent: 0,
        force_cache_chunk: false,
    }
}

#[test]
fn ongoing_recovery_ignores_a_partial_record() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");
    let config = variable_config(1024, 512);

    let chunk = Chunk::create_new(&path, 0, config, false).expect("create");
    chunk
        .try_append(&BytesRecord(vec![1u8; 10]))
        .expect("append");
    chunk
        .try_append(&BytesRecord(vec![2u8; 20]))
        .expect("append");
    chunk
        .try_append(&BytesRecord(vec![3u8; 12]))
        .expect("append");
    chunk.flush().expect("flush");
    chunk.close().expect("close");
    drop(chunk);

    // Wipe the third record's length suffix, as if the process died before
    // the frame fully reached the file.
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .expect("open");
    file.seek(SeekFrom::Start(u64::from(CHUNK_HEADER_SIZE) + 46 + 4 + 12))
        .expect("seek");
    file.write_all(&[0u8; 4]).expect("wipe suffix");
    drop(file);

    let reopened =
        Chunk::from_ongoing_file(&path, config, read_bytes_record, false).expect("recover");
    assert_eq!(reopened.data_position(), 46);
    assert!(!reopened.is_completed());

    // Earlier records survive; the partial one is gone and gets overwritten.
    assert_eq!(
        reopened.try_read_at(0, read_bytes_record).expect("read").0,
        vec![1u8; 10]
    );
    let result = reopened
        .try_append(&BytesRecord(vec![7u8; 5]))
        .expect("append");
    assert_eq!(result.position(), Some(46));
    assert_eq!(
        reopened.try_read_at(46, read_bytes_record).expect("read").0,
        vec![7u8; 5]
    );
}

#[test]
fn recovery_is_idempotent() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");
    let config = variable_config(1024, 512);

    let chunk = Chunk::create_new(&path, 0, config, false).expect("create");
    chunk
        .try_append(&BytesRecord(vec![1u8; 10]))
        .expect("append");
    chunk
        .try_append(&BytesRecord(vec![2u8; 20]))
        .expect("append");
    chunk.flush().expect("flush");
    chunk.close().expect("close");

    for _ in 0..3 {
        let reopened =
            Chunk::from_ongoing_file(&path, config, read_bytes_record, false).expect("recover");
        assert_eq!(reopened.data_position(), 46);
        reopened.close().expect("close");
    }
}

#[test]
fn fixed_mode_recovery_stops_at_the_first_blank_unit() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");
    let config = fixed_config(16, 4);

    let chunk = Chunk::create_new(&path, 0, config, false).expect("create");
    chunk
        .try_append(&BytesRecord(vec![0x11; 16]))
        .expect("append");
    chunk
        .try_append(&BytesRecord(vec![0x22; 16]))
        .expect("append");
    chunk.flush().expect("flush");
    chunk.close().expect("close");

    // A blank unit is an unwritten slot; the factory signals it with None.
    let factory = |length: u32, reader: &mut dyn Read| -> io::Result<Option<BytesRecord>> {
        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;
        if payload.iter().all(|byte| *byte == 0) {
            return Ok(None);
        }
        Ok(Some(BytesRecord(payload)))
    };
    let reopened = Chunk::from_ongoing_file(&path, config, factory, false).expect("recover");
    assert_eq!(reopened.data_position(), 32);
}

#[test]
fn corrupted_suffix_raises_invalid_read() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");
    let chunk = Chunk::create_new(&path, 0, variable_config(1024, 512), false).expect("create");
    chunk
        .try_append(&BytesRecord(vec![4u8; 10]))
        .expect("append");
    chunk.flush().expect("flush");

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .expect("open");
    file.seek(SeekFrom::Start(u64::from(CHUNK_HEADER_SIZE) + 14))
        .expect("seek");
    file.write_all(&[0xFF; 4]).expect("corrupt suffix");
    drop(file);

    assert!(matches!(
        chunk.try_read_at(0, read_bytes_record),
        Err(ChunkError::InvalidRead(_))
    ));
}

#[test]
fn missing_files_are_reported_as_chunk_file_not_exist() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("missing-chunk");
    let config = variable_config(1024, 512);

    assert!(matches!(
        Chunk::from_completed_file(&path, config, false),
        Err(ChunkError::CorruptDatabase {
            reason: CorruptReason::ChunkFileNotExist,
            ..
        })
    ));
    assert!(matches!(
        Chunk::from_ongoing_file(&path, config, read_bytes_record, false),
        Err(ChunkError::CorruptDatabase {
            reason: CorruptReason::ChunkFileNotExist,
            ..
        })
    ));
}

#[test]
fn garbage_files_are_reported_as_bad_chunks() {
    let tmp = TempDir::new().expect("tempdir");
    let config = variable_config(1024, 512);

    let short = tmp.path().join("short-chunk");
    std::fs::write(&short, b"tiny").expect("write");
    assert!(matches!(
        Chunk::from_completed_file(&short, config, false),
        Err(ChunkError::CorruptDatabase {
            reason: CorruptReason::BadChunkInDatabase,
            ..
        })
    ));

    let garbage = tmp.path().join("garbage-chunk");
    std::fs::write(&garbage, vec![0xEE; 2048]).expect("write");
    assert!(matches!(
        Chunk::from_ongoing_file(&garbage, config, read_bytes_record, false),
        Err(ChunkError::CorruptDatabase {
            reason: CorruptReason::BadChunkInDatabase,
            ..
        })
    ));
}

#[test]
fn completed_chunks_reopen_and_validate_length() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");
    let config = variable_config(1024, 512);

    let chunk = Chunk::create_new(&path, 0, config, false).expect("create");
    for index in 0u8..3 {
        chunk
            .try_append(&BytesRecord(vec![index; 10]))
            .expect("append");
    }
    chunk.complete().expect("complete");
    chunk.close().expect("close");
    drop(chunk);

    let reopened = Chunk::from_completed_file(&path, config, false).expect("reopen");
    assert!(reopened.is_completed());
    assert_eq!(reopened.data_position(), 3 * 18);
    assert_eq!(
        reopened.try_read_at(18, read_bytes_record).expect("read").0,
        vec![1u8; 10]
    );
    reopened.close().expect("close");

    // A trailing stray byte breaks the length equation.
    chunklog::fs::set_read_only(&path, false).expect("clear attribute");
    let mut file = OpenOptions::new().append(true).open(&path).expect("open");
    file.write_all(&[0u8]).expect("grow");
    drop(file);
    assert!(matches!(
        Chunk::from_completed_file(&path, config, false),
        Err(ChunkError::CorruptDatabase {
            reason: CorruptReason::BadChunkInDatabase,
            ..
        })
    ));
}

#[test]
fn header_and_config_must_agree_on_reopen() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("chunk-000000");
    let chunk =
        Chunk::create_new(&path, 0, variable_config(1024, 512), false).expect("create");
    chunk.close().expect("close");

    let other = variable_config(2048, 512);
    assert!(matches!(
        Chunk::from_ongoing_file(&path, other, read_bytes_record, false),
        Err(ChunkError::CorruptDatabase {
            reason: CorruptReason::BadChunkInDatabase,
            ..
        })
    ));
}
