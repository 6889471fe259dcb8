//! Embedded key-value store using RocksDB.
//!
//! All persisted state lives in one RocksDB instance with a column family per
//! logical namespace. Every index mutation is staged in a [`StoreBatch`] and
//! committed as a single atomic `WriteBatch`, so a handler either applies
//! fully or not at all.
//!
//! # Key Design
//!
//! - Keys are `\0`-separated UTF-8 components (see [`key`] and [`prefix`])
//! - Numeric components that must sort are zero-padded decimal
//! - Counters are 8-byte big-endian `u64`
//! - Values are JSON

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{Error, Result};

const CURSOR_KEY: &[u8] = b"cursor";
const SEQUENCE_PREFIX: &str = "seq";

/// Logical namespaces, one RocksDB column family each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Likes,
    Comments,
    Notifications,
    Authors,
    Records,
    Reports,
    Hidden,
    Audit,
    Meta,
}

impl Namespace {
    pub const ALL: [Namespace; 9] = [
        Self::Likes,
        Self::Comments,
        Self::Notifications,
        Self::Authors,
        Self::Records,
        Self::Reports,
        Self::Hidden,
        Self::Audit,
        Self::Meta,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Likes => "likes",
            Self::Comments => "comments",
            Self::Notifications => "notifications",
            Self::Authors => "authors",
            Self::Records => "records",
            Self::Reports => "reports",
            Self::Hidden => "hidden",
            Self::Audit => "audit",
            Self::Meta => "meta",
        }
    }
}

/// Build a key from `\0`-separated components.
pub fn key(parts: &[&str]) -> Vec<u8> {
    parts.join("\0").into_bytes()
}

/// Build a scan prefix: the components followed by a trailing separator.
pub fn prefix(parts: &[&str]) -> Vec<u8> {
    let mut p = key(parts);
    p.push(0);
    p
}

/// Zero-padded decimal so that lexical order matches numeric order.
pub fn sortable(n: u64) -> String {
    format!("{n:020}")
}

/// Split a stored key back into its components.
pub fn split_key(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

fn decode_u64(raw: &[u8]) -> Option<u64> {
    raw.try_into().ok().map(u64::from_be_bytes)
}

/// RocksDB-backed store shared by the index and the automod engine.
///
/// Thread-safe: share via `Arc<Store>`.
pub struct Store {
    db: DBWithThreadMode<MultiThreaded>,
    /// Serialises sequence allocation.
    sequence_lock: Mutex<()>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);
        opts.set_max_background_jobs(4);

        let descriptors = Namespace::ALL
            .iter()
            .map(|ns| ColumnFamilyDescriptor::new(ns.name(), Self::cf_options()))
            .collect::<Vec<_>>();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, descriptors)?;

        let store = Self {
            db,
            sequence_lock: Mutex::new(()),
        };
        for ns in Namespace::ALL {
            store.cf(ns)?;
        }
        Ok(store)
    }

    fn cf_options() -> Options {
        let mut opts = Options::default();
        opts.set_write_buffer_size(16 * 1024 * 1024);
        opts.set_compression_type(DBCompressionType::Lz4);

        // Point lookups dominate (has-liked, is-hidden): bloom filters make
        // misses cheap. 10 bits per key is ~1% false positives.
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf(&self, ns: Namespace) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(ns.name())
            .ok_or(Error::MissingColumnFamily(ns.name()))
    }

    /// Read a raw value.
    pub fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(ns)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    /// Read and deserialize a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, ns: Namespace, key: &[u8]) -> Result<Option<T>> {
        match self.get(ns, key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read a big-endian counter, treating absence as zero.
    pub fn get_u64(&self, ns: Namespace, key: &[u8]) -> Result<u64> {
        Ok(self
            .get(ns, key)?
            .and_then(|raw| decode_u64(&raw))
            .unwrap_or(0))
    }

    pub fn contains(&self, ns: Namespace, key: &[u8]) -> Result<bool> {
        Ok(self.get(ns, key)?.is_some())
    }

    /// Start a new atomic batch.
    pub fn batch(&self) -> StoreBatch {
        StoreBatch::default()
    }

    /// Commit a batch atomically.
    pub fn write(&self, batch: StoreBatch) -> Result<()> {
        if batch.ops.is_empty() {
            return Ok(());
        }

        let mut write_batch = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(ns, k, v) => write_batch.put_cf(&self.cf(ns)?, k, v),
                BatchOp::Delete(ns, k) => write_batch.delete_cf(&self.cf(ns)?, k),
            }
        }
        self.db.write(write_batch)?;
        Ok(())
    }

    /// Forward scan of all keys starting with `prefix`, beginning at `from`
    /// (inclusive) when given.
    pub fn scan_prefix(
        &self,
        ns: Namespace,
        prefix: &[u8],
        from: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(ns)?;
        let start = from.unwrap_or(prefix);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(start, Direction::Forward));

        let mut items = Vec::new();
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(prefix) || items.len() >= limit {
                break;
            }
            items.push((k.into_vec(), v.into_vec()));
        }
        Ok(items)
    }

    /// Reverse scan of keys starting with `prefix`, newest (largest) first.
    ///
    /// When `before` is given only keys strictly less than it are returned.
    pub fn scan_prefix_rev(
        &self,
        ns: Namespace,
        prefix: &[u8],
        before: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(ns)?;
        let mut upper = prefix.to_vec();
        upper.push(0xFF);
        let start = before.unwrap_or(upper.as_slice());

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(start, Direction::Reverse));

        let mut items = Vec::new();
        for item in iter {
            let (k, v) = item?;
            if before.is_some_and(|b| k.as_ref() >= b) {
                continue;
            }
            if !k.starts_with(prefix) || items.len() >= limit {
                break;
            }
            items.push((k.into_vec(), v.into_vec()));
        }
        Ok(items)
    }

    /// Count keys under a prefix.
    pub fn count_prefix(&self, ns: Namespace, prefix: &[u8]) -> Result<usize> {
        let cf = self.cf(ns)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut count = 0usize;
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Allocate the next value of a named monotonic sequence (starts at 1).
    pub fn next_sequence(&self, name: &str) -> Result<u64> {
        let _guard = self.sequence_lock.lock();
        let seq_key = key(&[SEQUENCE_PREFIX, name]);
        let next = self.get_u64(Namespace::Meta, &seq_key)? + 1;
        let cf = self.cf(Namespace::Meta)?;
        self.db.put_cf(&cf, &seq_key, next.to_be_bytes())?;
        Ok(next)
    }

    /// Last persisted stream cursor.
    pub fn load_cursor(&self) -> Result<Option<u64>> {
        Ok(self
            .get(Namespace::Meta, CURSOR_KEY)?
            .and_then(|raw| decode_u64(&raw)))
    }

    /// Persist the stream cursor.
    ///
    /// Not synced to disk on every call; [`Store::flush`] makes it durable.
    pub fn save_cursor(&self, cursor: u64) -> Result<()> {
        let cf = self.cf(Namespace::Meta)?;
        self.db.put_cf(&cf, CURSOR_KEY, cursor.to_be_bytes())?;
        Ok(())
    }

    /// Persist the cursor with a synced write.
    pub fn save_cursor_durable(&self, cursor: u64) -> Result<()> {
        let cf = self.cf(Namespace::Meta)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(&cf, CURSOR_KEY, cursor.to_be_bytes(), &write_opts)?;
        Ok(())
    }

    /// Flush memtables of every namespace to disk.
    pub fn flush(&self) -> Result<()> {
        for ns in Namespace::ALL {
            self.db.flush_cf(&self.cf(ns)?)?;
        }
        debug!("Store flushed");
        Ok(())
    }

    /// Approximate number of keys in a namespace.
    pub fn approximate_keys(&self, ns: Namespace) -> Result<u64> {
        let cf = self.cf(ns)?;
        Ok(self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }
}

enum BatchOp {
    Put(Namespace, Vec<u8>, Vec<u8>),
    Delete(Namespace, Vec<u8>),
}

/// Staged mutations committed together by [`Store::write`].
#[derive(Default)]
pub struct StoreBatch {
    ops: Vec<BatchOp>,
}

impl StoreBatch {
    pub fn put(&mut self, ns: Namespace, key: Vec<u8>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(ns, key, value.into()));
    }

    pub fn put_json<T: Serialize>(&mut self, ns: Namespace, key: Vec<u8>, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.put(ns, key, raw);
        Ok(())
    }

    pub fn put_u64(&mut self, ns: Namespace, key: Vec<u8>, value: u64) {
        self.put(ns, key, value.to_be_bytes().to_vec());
    }

    pub fn delete(&mut self, ns: Namespace, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(ns, key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
