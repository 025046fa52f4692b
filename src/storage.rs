// src/storage.rs
// Bucket store backing the accumulator (RocksDB or in-memory)

use crate::error::{RelayError, Result};
use parking_lot::Mutex;
use rocksdb::{Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

/// Type alias for RocksDB (Arc for cheap cloning)
pub type RocksDb = Arc<DB>;

/// Byte-oriented key/value bucket. One bucket per relay link.
pub trait Bucket: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn has(&self, key: &[u8]) -> Result<bool>;
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Open RocksDB, retrying with backoff while another process releases the lock.
pub fn open_db(path: &str) -> Result<RocksDb> {
    let mut attempt = 0u32;
    let max_attempts = 8u32;
    let mut wait = 250u64;

    loop {
        match open_rocksdb_internal(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(RelayError::Storage(format!(
                        "failed to open RocksDB at '{}' after {} attempts: {}",
                        path, attempt, e
                    )));
                }
                log::warn!(
                    "open_db attempt {}/{} failed: {} - retrying in {}ms",
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                sleep(Duration::from_millis(wait));
                wait = std::cmp::min(wait * 2, 2000);
            }
        }
    }
}

fn open_rocksdb_internal(path: &str) -> std::result::Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);

    let num_cpus = num_cpus::get() as i32;
    opts.increase_parallelism(num_cpus);
    opts.set_max_background_jobs(4);
    opts.set_write_buffer_size(64 * 1024 * 1024); // 64MB
    opts.set_max_open_files(512);

    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

    DB::open(&opts, path)
}

/// RocksDB-backed bucket. Keys are namespaced as `<link>/<key>`.
#[derive(Clone)]
pub struct RocksBucket {
    db: RocksDb,
    prefix: Vec<u8>,
}

impl RocksBucket {
    pub fn new(db: RocksDb, link: &str) -> Self {
        let mut prefix = link.as_bytes().to_vec();
        prefix.push(b'/');
        Self { db, prefix }
    }

    fn key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.prefix.len() + key.len());
        k.extend_from_slice(&self.prefix);
        k.extend_from_slice(key);
        k
    }
}

impl Bucket for RocksBucket {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(self.key(key))?)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(self.key(key), value)?;
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.db.get_pinned(self.key(key))?.is_some())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(self.key(key))?;
        Ok(())
    }
}

/// In-memory bucket for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBucket {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Bucket for MemoryBucket {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.lock().contains_key(key))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Put a serializable value under a key.
pub fn put<V: Serialize>(bucket: &dyn Bucket, key: &[u8], val: &V) -> Result<()> {
    let bytes = serde_json::to_vec(val)?;
    bucket.set(key, &bytes)
}

/// Get and deserialize a value stored under a key.
pub fn get<T: DeserializeOwned>(bucket: &dyn Bucket, key: &[u8]) -> Result<Option<T>> {
    match bucket.get(key)? {
        Some(bytes) => {
            let v = serde_json::from_slice::<T>(&bytes)
                .map_err(|e| RelayError::Format(e.to_string()))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_bucket_roundtrip() {
        let bucket = MemoryBucket::new();
        assert!(!bucket.has(b"k").unwrap());
        bucket.set(b"k", b"v").unwrap();
        assert!(bucket.has(b"k").unwrap());
        assert_eq!(bucket.get(b"k").unwrap(), Some(b"v".to_vec()));
        bucket.delete(b"k").unwrap();
        assert!(bucket.is_empty());
    }

    #[test]
    fn rocks_bucket_namespaces_links() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path().to_str().unwrap()).unwrap();
        let a = RocksBucket::new(db.clone(), "icon-to-bsc");
        let b = RocksBucket::new(db, "bsc-to-icon");

        a.set(b"state", b"a").unwrap();
        assert_eq!(a.get(b"state").unwrap(), Some(b"a".to_vec()));
        assert!(!b.has(b"state").unwrap());
    }

    #[test]
    fn corrupted_json_is_format_error() {
        let bucket = MemoryBucket::new();
        bucket.set(b"state", b"{not json").unwrap();
        let res: Result<Option<u64>> = get(&bucket, b"state");
        assert!(matches!(res, Err(RelayError::Format(_))));
    }
}
