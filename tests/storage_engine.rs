// SPDX-License-Identifier: MIT

//! P2 (persistence round-trip) and P3 (crash-recovery-shaped reopen), driven
//! against a real temp directory rather than `storage::Engine`'s unit tests.

use smq::storage::{Engine, StorageError};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> Engine {
    Engine::open_with_slot_size(dir, "durable", 24 + 128 * 16, 128).unwrap()
}

#[test]
fn lookup_after_free_is_handle_stale() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    let handle = engine.insert(b"hello").unwrap();
    assert_eq!(engine.lookup(handle).unwrap(), b"hello");

    engine.free(handle).unwrap();
    assert!(matches!(engine.lookup(handle), Err(StorageError::HandleStale)));
    // Freeing an already-free handle is a no-op that reports HandleStale.
    assert!(matches!(engine.free(handle), Err(StorageError::HandleStale)));
}

#[test]
fn many_records_survive_a_reopen_without_double_counting_freed_ones() {
    let dir = tempdir().unwrap();
    let mut kept = Vec::new();
    {
        let engine = open(dir.path());
        for i in 0..20u32 {
            let handle = engine.insert(format!("msg-{i}").as_bytes()).unwrap();
            if i % 3 == 0 {
                engine.free(handle).unwrap();
            } else {
                kept.push(format!("msg-{i}"));
            }
        }
        engine.flush().unwrap();
    }

    let reopened = open(dir.path());
    let recovered: Vec<Vec<u8>> = reopened.load().into_iter().map(|(_, bytes)| bytes).collect();

    assert_eq!(recovered.len(), kept.len());
    for expected in kept {
        assert!(recovered.iter().any(|bytes| bytes == expected.as_bytes()));
    }
}

#[test]
fn corrupt_bucket_file_is_quarantined_not_fatal() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path());
        engine.insert(b"good-record").unwrap();
        engine.flush().unwrap();
    }

    // Drop a garbage file matching this object's bucket naming convention
    // alongside the real bucket.
    std::fs::write(dir.path().join("durable-999.bkt"), vec![0u8; 64]).unwrap();

    let reopened = open(dir.path());
    let recovered = reopened.load();
    assert!(recovered.iter().any(|(_, bytes)| bytes == b"good-record"));
    assert!(dir.path().join("durable-999.bkt.corrupt").exists());
}

#[test]
fn insert_spills_across_many_buckets_under_sustained_load() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_slot_size(dir.path(), "spill", 24 + 4 * 32, 32).unwrap();

    let mut handles = Vec::new();
    for i in 0..50u32 {
        handles.push(engine.insert(&i.to_le_bytes()).unwrap());
    }
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(engine.lookup(*handle).unwrap(), (i as u32).to_le_bytes());
    }
}
