//! Log replay, corruption detection, and rewrite tests.
//!
//! On-disk record layout exercised here:
//!
//! ```text
//! [id: i32 LE][size: u32 LE][payload: size bytes][crc32c: u32 LE]
//! ```

use super::{replay_into, write_record, AofEngine};
use crate::crc32c::crc32c;
use crate::error::Error;
use crate::store::Store;

use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const BATCH_INTERVAL: Duration = Duration::from_millis(5);

fn flip_byte(path: &std::path::Path, offset: usize) {
    let mut bytes = fs::read(path).expect("read log");
    bytes[offset] ^= 0xFF;
    fs::write(path, &bytes).expect("rewrite log");
}

#[test]
fn record_framing_is_id_size_payload_crc() {
    let mut buf = Vec::new();
    write_record(&mut buf, 42, b"hey").expect("frame record");

    assert_eq!(buf.len(), 15);
    assert_eq!(&buf[0..4], &42i32.to_le_bytes());
    assert_eq!(&buf[4..8], &3u32.to_le_bytes());
    assert_eq!(&buf[8..11], b"hey");

    let mut crc = crc32c(0, &42i32.to_le_bytes());
    crc = crc32c(crc, &3u32.to_le_bytes());
    crc = crc32c(crc, b"hey");
    assert_eq!(&buf[11..15], &crc.to_le_bytes());
}

#[test]
fn replay_missing_file_is_clean() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = Store::new();
    let applied = replay_into(&dir.path().join("absent.aof"), &mut store).expect("replay");
    assert_eq!(applied, 0);
    assert!(store.is_empty());
}

#[test]
fn sync_always_append_replays_identically() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    engine
        .append(7, br#"{"id":7,"name":"neo"}"#)
        .expect("append");
    drop(engine);

    let mut store = Store::new();
    let applied = replay_into(&path, &mut store).expect("replay");
    assert_eq!(applied, 1);
    assert_eq!(store.get(7), Some(&br#"{"id":7,"name":"neo"}"#[..]));
}

#[test]
fn batched_appends_survive_drop() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 16, BATCH_INTERVAL).expect("open");
    for id in 0..100 {
        engine.append(id, id.to_string().as_bytes()).expect("append");
    }
    // Dropping joins the writer, which drains and fsyncs the residual ring.
    drop(engine);

    let mut store = Store::new();
    assert_eq!(replay_into(&path, &mut store).expect("replay"), 100);
    for id in 0..100 {
        let expected = id.to_string();
        assert_eq!(store.get(id), Some(expected.as_bytes()));
    }
}

#[test]
fn flush_commits_the_batch_inline() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 64, Duration::from_secs(3600)).expect("open");
    engine.append(1, b"a").expect("append");
    engine.append(2, b"b").expect("append");
    engine.flush().expect("flush");

    // The file is complete on disk even though the engine is still alive
    // and its flush interval is nowhere near elapsing.
    let mut store = Store::new();
    assert_eq!(replay_into(&path, &mut store).expect("replay"), 2);
    assert_eq!(store.get(1), Some(&b"a"[..]));
    assert_eq!(store.get(2), Some(&b"b"[..]));
}

#[test]
fn small_ring_forces_producer_to_wait_for_writer() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    // Two slots -> one usable entry: every second append must wait for the
    // writer to drain, exercising the full-ring path.
    let engine = AofEngine::open(&path, 2, Duration::from_millis(1)).expect("open");
    for id in 0..50 {
        engine.append(id, b"payload").expect("append");
    }
    drop(engine);

    let mut store = Store::new();
    assert_eq!(replay_into(&path, &mut store).expect("replay"), 50);
}

#[test]
fn replay_applies_records_in_log_order() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    engine.append(1, b"first").expect("append");
    engine.append(1, b"second").expect("append");
    drop(engine);

    let mut store = Store::new();
    assert_eq!(replay_into(&path, &mut store).expect("replay"), 2);
    assert_eq!(store.get(1), Some(&b"second"[..]));
    assert_eq!(store.len(), 1);
}

#[test]
fn replay_twice_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    for id in 0..20 {
        engine.append(id, id.to_string().as_bytes()).expect("append");
    }
    drop(engine);

    let mut store = Store::new();
    replay_into(&path, &mut store).expect("first replay");
    replay_into(&path, &mut store).expect("second replay");
    assert_eq!(store.len(), 20);
    for id in 0..20 {
        let expected = id.to_string();
        assert_eq!(store.get(id), Some(expected.as_bytes()));
    }
}

#[test]
fn flipped_byte_in_first_record_reports_offset_zero() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    engine.append(42, b"hey").expect("append");
    drop(engine);

    flip_byte(&path, 2);

    let mut store = Store::new();
    match replay_into(&path, &mut store) {
        Err(Error::LogCorruption { offset }) => assert_eq!(offset, 0),
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn flipped_byte_in_later_record_reports_its_offset() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    engine.append(1, b"aaaa").expect("append"); // 16 bytes on disk
    engine.append(2, b"bbbb").expect("append");
    drop(engine);

    flip_byte(&path, 16 + 9); // inside the second record's payload

    let mut store = Store::new();
    match replay_into(&path, &mut store) {
        Err(Error::LogCorruption { offset }) => assert_eq!(offset, 16),
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn truncated_payload_is_corruption() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let mut framed = Vec::new();
    write_record(&mut framed, 5, b"truncate me").expect("frame");
    fs::write(&path, &framed[..framed.len() - 6]).expect("write torn log");

    let mut store = Store::new();
    assert!(matches!(
        replay_into(&path, &mut store),
        Err(Error::LogCorruption { offset: 0 })
    ));
}

#[test]
fn partial_leading_id_is_corruption() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");
    fs::write(&path, [0xABu8, 0xCD]).expect("write stub");

    let mut store = Store::new();
    assert!(matches!(
        replay_into(&path, &mut store),
        Err(Error::LogCorruption { offset: 0 })
    ));
}

#[test]
fn valid_prefix_is_not_applied_when_tail_is_corrupt() {
    // Corruption is fatal for the whole load, not a truncation point: the
    // error must surface even though the first record was intact.
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    engine.append(1, b"ok").expect("append");
    engine.append(2, b"bad").expect("append");
    drop(engine);

    let file_len = fs::metadata(&path).expect("stat").len() as usize;
    flip_byte(&path, file_len - 1); // last CRC byte

    let mut store = Store::new();
    assert!(replay_into(&path, &mut store).is_err());
}

#[test]
fn rewrite_in_batched_mode_produces_minimal_equivalent_log() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let mut store = Store::new();
    let engine = AofEngine::open(&path, 1024, BATCH_INTERVAL).expect("open");
    for id in 1..=1000 {
        let payload = id.to_string();
        engine.append(id, payload.as_bytes()).expect("append");
        store.save(id, payload.as_bytes());
    }
    for id in (2..=1000).step_by(2) {
        engine.append(id, b"x").expect("append");
        store.save(id, b"x");
    }
    engine.flush().expect("flush");
    let before = fs::metadata(&path).expect("stat").len();

    engine.rewrite(&store).expect("rewrite");
    let after = fs::metadata(&path).expect("stat").len();
    assert!(after < before, "rewrite did not shrink the log");

    let mut replayed = Store::new();
    assert_eq!(replay_into(&path, &mut replayed).expect("replay"), 1000);
    for id in 1..=1000 {
        let expected = if id % 2 == 0 {
            "x".to_string()
        } else {
            id.to_string()
        };
        assert_eq!(replayed.get(id), Some(expected.as_bytes()), "key {id}");
    }
}

#[test]
fn rewrite_in_sync_always_mode_rederives_state_from_the_log() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    engine.append(1, b"one").expect("append");
    engine.append(2, b"two").expect("append");
    engine.append(1, b"uno").expect("append");

    // The store argument is not consulted in this mode; the log is.
    engine.rewrite(&Store::new()).expect("rewrite");

    let mut replayed = Store::new();
    assert_eq!(replay_into(&path, &mut replayed).expect("replay"), 2);
    assert_eq!(replayed.get(1), Some(&b"uno"[..]));
    assert_eq!(replayed.get(2), Some(&b"two"[..]));

    // The append fd was reopened onto the new file.
    engine.append(3, b"three").expect("append after rewrite");
    let mut again = Store::new();
    assert_eq!(replay_into(&path, &mut again).expect("replay"), 3);
    assert_eq!(again.get(3), Some(&b"three"[..]));
}

#[test]
fn rewrite_leaves_no_temp_file() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = AofEngine::open(&path, 0, Duration::ZERO).expect("open");
    engine.append(1, b"v").expect("append");
    engine.rewrite(&Store::new()).expect("rewrite");

    assert!(path.exists());
    assert!(!dir.path().join("test.aof.tmp").exists());
}

#[test]
fn appends_from_another_thread_all_reach_the_log() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.aof");

    let engine = std::sync::Arc::new(AofEngine::open(&path, 1024, BATCH_INTERVAL).expect("open"));
    let worker = {
        let engine = std::sync::Arc::clone(&engine);
        std::thread::spawn(move || {
            for id in 0..100 {
                engine.append(id, b"concurrent").expect("append");
            }
        })
    };
    worker.join().expect("worker");
    drop(engine);

    let mut store = Store::new();
    assert_eq!(replay_into(&path, &mut store).expect("replay"), 100);
}
