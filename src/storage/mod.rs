// SPDX-License-Identifier: MIT

//! Mmap-backed persistent record storage (spec.md §4.1).
//!
//! An [`Engine`] owns a directory of fixed-size bucket files named
//! `<object_name>-<bucket_id>.bkt`. Records are inserted into whichever
//! bucket currently has a free slot, discovered by round-robining a cursor
//! across the open buckets so that writes are spread across files instead
//! of always hammering bucket 0. When every existing bucket is full, a new
//! bucket file is created and appended to the directory.

mod bucket;
mod error;
mod handle;

pub use error::{StorageError, StorageResult};
pub use handle::Handle;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use bucket::Bucket;

const DEFAULT_SLOT_SIZE: u32 = 4096;

/// Durable storage for a single named object (spec.md's "object" is the
/// persistence unit behind a destination, e.g. a queue or topic's backlog).
pub struct Engine {
    directory: PathBuf,
    object_name: String,
    slot_size: u32,
    slots_per_bucket: u32,
    buckets: RwLock<BTreeMap<u32, Arc<Mutex<Bucket>>>>,
    next_bucket_id: AtomicUsize,
    rotor: AtomicUsize,
}

impl Engine {
    /// Open (or create, if empty) the storage directory for `object_name`.
    /// `bucket_bytes` is the total size of each bucket file; slot size is
    /// fixed engine-wide at [`DEFAULT_SLOT_SIZE`] bytes per spec.md §9.
    pub fn open(directory: impl Into<PathBuf>, object_name: impl Into<String>, bucket_bytes: u64) -> StorageResult<Self> {
        Self::open_with_slot_size(directory, object_name, bucket_bytes, DEFAULT_SLOT_SIZE)
    }

    pub fn open_with_slot_size(
        directory: impl Into<PathBuf>,
        object_name: impl Into<String>,
        bucket_bytes: u64,
        slot_size: u32,
    ) -> StorageResult<Self> {
        let directory = directory.into();
        let object_name = object_name.into();
        std::fs::create_dir_all(&directory)?;

        let header_len = bucket::HEADER_LEN as u64;
        if bucket_bytes <= header_len + slot_size as u64 {
            return Err(StorageError::InvalidConfig(format!(
                "bucket_bytes {bucket_bytes} too small to hold even one {slot_size}-byte slot"
            )));
        }
        let slots_per_bucket = ((bucket_bytes - header_len) / slot_size as u64) as u32;

        let engine = Self {
            directory,
            object_name,
            slot_size,
            slots_per_bucket,
            buckets: RwLock::new(BTreeMap::new()),
            next_bucket_id: AtomicUsize::new(0),
            rotor: AtomicUsize::new(0),
        };

        engine.load_existing()?;
        Ok(engine)
    }

    fn bucket_path(&self, bucket_id: u32) -> PathBuf {
        self.directory
            .join(format!("{}-{}.bkt", self.object_name, bucket_id))
    }

    /// Scan the directory for this object's bucket files, opening each and
    /// quarantining any that fail header validation so the rest of the
    /// object can still load (spec.md §7, `StorageCorrupt` recovery).
    fn load_existing(&self) -> StorageResult<()> {
        let prefix = format!("{}-", self.object_name);
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&prefix) || !name.ends_with(".bkt") {
                continue;
            }
            found.push(entry.path());
        }
        found.sort();

        let mut buckets = self.buckets.write();
        let mut max_id = 0u32;
        for path in found {
            match Bucket::open(&path) {
                Ok(bucket) => {
                    let id = bucket.bucket_id();
                    max_id = max_id.max(id + 1);
                    buckets.insert(id, Arc::new(Mutex::new(bucket)));
                }
                Err(StorageError::StorageCorrupt { path: p, reason }) => {
                    tracing::warn!(path = %p, reason, "quarantining corrupt bucket file");
                    if let Err(e) = bucket::quarantine(&path) {
                        tracing::error!(?e, "failed to quarantine corrupt bucket file");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.next_bucket_id.store(max_id as usize, Ordering::Relaxed);
        Ok(())
    }

    fn create_bucket(&self, buckets: &mut BTreeMap<u32, Arc<Mutex<Bucket>>>) -> StorageResult<u32> {
        let id = self.next_bucket_id.fetch_add(1, Ordering::Relaxed) as u32;
        let path = self.bucket_path(id);
        let bucket = Bucket::create(&path, id, self.slot_size, self.slots_per_bucket)?;
        buckets.insert(id, Arc::new(Mutex::new(bucket)));
        Ok(id)
    }

    /// Insert `payload`, returning a stable [`Handle`]. Tries existing
    /// buckets round-robin starting from the rotor cursor; creates a new
    /// bucket only if every existing one is full.
    pub fn insert(&self, payload: &[u8]) -> StorageResult<Handle> {
        // Fast path: try existing buckets without taking the write lock.
        {
            let buckets = self.buckets.read();
            if !buckets.is_empty() {
                let ids: Vec<u32> = buckets.keys().copied().collect();
                let start = self.rotor.fetch_add(1, Ordering::Relaxed) % ids.len();
                for i in 0..ids.len() {
                    let id = ids[(start + i) % ids.len()];
                    let bucket = &buckets[&id];
                    let mut locked = bucket.lock();
                    if let Some(handle) = locked.try_insert(payload)? {
                        return Ok(handle);
                    }
                }
            }
        }

        // Every bucket was full (or there were none yet): create a new one.
        let mut buckets = self.buckets.write();
        let id = self.create_bucket(&mut buckets)?;
        let bucket = buckets[&id].clone();
        drop(buckets);
        let mut locked = bucket.lock();
        locked
            .try_insert(payload)?
            .ok_or(StorageError::StorageFull)
    }

    pub fn lookup(&self, handle: Handle) -> StorageResult<Vec<u8>> {
        let buckets = self.buckets.read();
        let bucket = buckets.get(&handle.bucket_id()).ok_or(StorageError::HandleInvalid)?;
        bucket.lock().lookup(handle.slot_index())
    }

    pub fn free(&self, handle: Handle) -> StorageResult<()> {
        let buckets = self.buckets.read();
        let bucket = buckets.get(&handle.bucket_id()).ok_or(StorageError::HandleInvalid)?;
        bucket.lock().free(handle.slot_index())
    }

    /// Enumerate every record currently in use, in ascending
    /// `(bucket_id, slot_index)` order, for startup rehydration.
    pub fn load(&self) -> Vec<(Handle, Vec<u8>)> {
        let buckets = self.buckets.read();
        let mut out = Vec::new();
        for (&bucket_id, bucket) in buckets.iter() {
            let locked = bucket.lock();
            for slot in locked.in_use_slots() {
                if let Ok(payload) = locked.lookup(slot) {
                    out.push((Handle::new(bucket_id, slot), payload));
                }
            }
        }
        out
    }

    pub fn flush(&self) -> std::io::Result<()> {
        for bucket in self.buckets.read().values() {
            bucket.lock().flush()?;
        }
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &Path) -> Engine {
        Engine::open_with_slot_size(dir, "queue", 24 + 64 * 4, 64).unwrap()
    }

    #[test]
    fn insert_lookup_free_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let handle = engine.insert(b"payload").unwrap();
        assert_eq!(engine.lookup(handle).unwrap(), b"payload");
        engine.free(handle).unwrap();
        assert!(matches!(engine.lookup(handle), Err(StorageError::HandleStale)));
    }

    #[test]
    fn spills_into_new_bucket_when_full() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut handles = Vec::new();
        for i in 0..8u8 {
            handles.push(engine.insert(&[i]).unwrap());
        }
        let bucket_ids: std::collections::HashSet<_> =
            handles.iter().map(|h| h.bucket_id()).collect();
        assert!(bucket_ids.len() >= 2, "expected spill into a second bucket");
    }

    #[test]
    fn load_rehydrates_across_reopen() {
        let dir = tempdir().unwrap();
        let handle = {
            let engine = engine(dir.path());
            let h = engine.insert(b"durable").unwrap();
            engine.flush().unwrap();
            h
        };

        let reopened = engine(dir.path());
        let records = reopened.load();
        assert!(records.iter().any(|(h, payload)| *h == handle && payload == b"durable"));
    }

    #[test]
    fn unknown_bucket_is_handle_invalid() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let bogus = Handle::new(999, 0);
        assert!(matches!(engine.lookup(bogus), Err(StorageError::HandleInvalid)));
    }
}
