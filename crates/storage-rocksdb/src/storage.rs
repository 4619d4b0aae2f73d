//! RocksDB-backed byte store.

use lodestone_storage::{RawKvStore, StoreError, StoreResult};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteOptions, DB};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{instrument, Level};

/// Column family holding trie nodes (and any other content-addressed data).
const NODES_CF: &str = "nodes";

/// Compression algorithm for the nodes column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// No compression.
    None,
    /// LZ4 (fast, the default).
    Lz4,
    /// Zstandard (denser, slower).
    Zstd,
}

impl CompressionKind {
    fn to_rocksdb(self) -> rocksdb::DBCompressionType {
        match self {
            CompressionKind::None => rocksdb::DBCompressionType::None,
            CompressionKind::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionKind::Zstd => rocksdb::DBCompressionType::Zstd,
        }
    }
}

/// Tuning knobs for the RocksDB backend.
///
/// The defaults match a small validator node; the node runner loads
/// overrides from its config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    /// Compression for the nodes column family.
    pub compression: CompressionKind,

    /// Block cache size in bytes, `None` to use the RocksDB default.
    pub block_cache_size: Option<usize>,

    /// Bloom filter bits per key, 0 to disable.
    pub bloom_filter_bits: f64,

    /// Memtable size in bytes.
    pub write_buffer_size: usize,

    /// Maximum number of memtables.
    pub max_write_buffer_number: i32,

    /// Background compaction/flush jobs.
    pub max_background_jobs: i32,

    /// Fsync on every write.
    ///
    /// The store contract requires writes to be durable before they
    /// return; disable only for throwaway test databases.
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Lz4,
            block_cache_size: Some(256 * 1024 * 1024),
            bloom_filter_bits: 10.0,
            write_buffer_size: 64 * 1024 * 1024,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
        }
    }
}

impl RocksDbConfig {
    /// A configuration for throwaway test databases: no fsync, no cache.
    pub fn test_default() -> Self {
        Self {
            block_cache_size: None,
            sync_writes: false,
            ..Self::default()
        }
    }
}

/// RocksDB-based [`RawKvStore`] for production use.
///
/// All operations are synchronous blocking I/O. Callers in async contexts
/// should use `spawn_blocking` if needed to avoid blocking the runtime.
///
/// Nodes are content-addressed (key = hash of value), so the backend never
/// overwrites: the content-mismatch check in [`RawKvStore::put`] is a
/// read-then-write, which is cheap because a colliding key is either hot
/// in the block cache or filtered out by the bloom filter.
pub struct RocksDbKvStore {
    db: Arc<DB>,
    write_opts_sync: bool,
}

impl RocksDbKvStore {
    /// Open or create a database at the given path with default config.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: RocksDbConfig) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(config.compression.to_rocksdb());

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let mut cf_opts = Options::default();
        cf_opts.set_compression_type(config.compression.to_rocksdb());
        let cf_descriptors = vec![ColumnFamilyDescriptor::new(NODES_CF, cf_opts)];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_opts_sync: config.sync_writes,
        })
    }

    fn nodes_cf(&self) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(NODES_CF)
            .ok_or_else(|| StoreError::Io(format!("missing column family {NODES_CF}")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.write_opts_sync);
        opts
    }
}

impl RawKvStore for RocksDbKvStore {
    #[instrument(level = Level::DEBUG, skip_all, fields(
        found = tracing::field::Empty,
        latency_us = tracing::field::Empty,
    ))]
    fn get_opt(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let start = Instant::now();
        let cf = self.nodes_cf()?;
        let result = self
            .db
            .get_cf(cf, key)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let span = tracing::Span::current();
        span.record("found", result.is_some());
        span.record("latency_us", start.elapsed().as_micros() as u64);

        Ok(result)
    }

    #[instrument(level = Level::DEBUG, skip_all)]
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let cf = self.nodes_cf()?;
        match self
            .db
            .get_cf(cf, key)
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Some(existing) if existing == value => Ok(()),
            Some(_) => {
                tracing::warn!(key = %hex_key(key), "rejected overwrite of content-addressed key");
                Err(StoreError::content_mismatch(key))
            }
            None => self
                .db
                .put_cf_opt(cf, key, value, &self.write_options())
                .map_err(|e| StoreError::Io(e.to_string())),
        }
    }

    fn remove(&self, key: &[u8]) -> StoreResult<()> {
        let cf = self.nodes_cf()?;
        self.db
            .delete_cf_opt(cf, key, &self.write_options())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.nodes_cf()?;
        let mut iter = self.db.raw_iterator_cf(cf);
        iter.seek(prefix);

        let mut out = Vec::new();
        while iter.valid() && out.len() < limit {
            let Some(key) = iter.key() else { break };
            if !key.starts_with(prefix) {
                break;
            }
            let Some(value) = iter.value() else { break };
            out.push((key.to_vec(), value.to_vec()));
            iter.next();
        }
        iter.status().map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(out)
    }
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}
