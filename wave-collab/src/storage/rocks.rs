//! RocksDB-backed entry store.
//!
//! Column families:
//! - `snapshots` — full document states (LZ4 compressed)
//! - `updates`   — incremental deltas (LZ4 compressed)
//!
//! Key format (both families):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ wave len │ wave_id  │ blip len │ blip_id  │ seq      │
//! │ 2 bytes  │ variable │ 2 bytes  │ variable │ 8 bytes  │
//! └──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//! Lengths and seq are big-endian, so a document's entries are contiguous
//! and iterate in seq order.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{EntryKind, EntryStore, StoreError, StoredEntry};
use crate::types::DocumentKey;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES];

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("wave_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Value layout; the blob is LZ4 compressed with its size prepended.
#[derive(Serialize, Deserialize)]
struct StoredValue {
    key: DocumentKey,
    seq: u64,
    origin: String,
    client_seq: u64,
    timestamp: u64,
    compressed: Vec<u8>,
}

impl StoredValue {
    fn encode(entry: &StoredEntry) -> Result<Vec<u8>, StoreError> {
        let value = StoredValue {
            key: entry.key.clone(),
            seq: entry.seq,
            origin: entry.origin.clone(),
            client_seq: entry.client_seq,
            timestamp: entry.timestamp,
            compressed: lz4_flex::compress_prepend_size(&entry.blob),
        };
        bincode::serde::encode_to_vec(&value, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(kind: EntryKind, bytes: &[u8]) -> Result<StoredEntry, StoreError> {
        let (value, _): (StoredValue, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let blob = lz4_flex::decompress_size_prepended(&value.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(StoredEntry {
            kind,
            key: value.key,
            seq: value.seq,
            blob,
            origin: value.origin,
            client_seq: value.client_seq,
            timestamp: value.timestamp,
        })
    }
}

/// RocksDB-backed [`EntryStore`].
pub struct RocksStore {
    /// Single-threaded column family mode; concurrency comes from the caller
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened entry store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Blobs are already LZ4 compressed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Few, large, point-looked-up by latest seq
                opts.set_max_write_buffer_number(2);
            }
            CF_UPDATES => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, kind: EntryKind) -> Result<&rocksdb::ColumnFamily, StoreError> {
        let name = match kind {
            EntryKind::Snapshot => CF_SNAPSHOTS,
            EntryKind::Update => CF_UPDATES,
        };
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl EntryStore for RocksStore {
    fn put(&self, entry: &StoredEntry) -> Result<(), StoreError> {
        let cf = self.cf(entry.kind)?;
        let key = entry_key(&entry.key, entry.seq)?;
        let value = StoredValue::encode(entry)?;
        self.db.put_cf_opt(&cf, key, value, &self.write_options())?;
        Ok(())
    }

    fn get(
        &self,
        kind: EntryKind,
        key: &DocumentKey,
        seq: u64,
    ) -> Result<Option<StoredEntry>, StoreError> {
        let cf = self.cf(kind)?;
        match self.db.get_cf(&cf, entry_key(key, seq)?)? {
            Some(bytes) => StoredValue::decode(kind, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn latest(&self, kind: EntryKind, key: &DocumentKey) -> Result<Option<StoredEntry>, StoreError> {
        let cf = self.cf(kind)?;
        let prefix = key_prefix(key)?;
        let end_key = entry_key(key, u64::MAX)?;

        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&end_key, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (k, value) = item?;
                if k.starts_with(&prefix) && k.len() == prefix.len() + 8 {
                    StoredValue::decode(kind, &value).map(Some)
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn query(
        &self,
        kind: EntryKind,
        key: Option<&DocumentKey>,
        after_seq: u64,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let cf = self.cf(kind)?;
        let mut entries = Vec::new();

        let Some(key) = key else {
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (_, value) = item?;
                let entry = StoredValue::decode(kind, &value)?;
                if entry.seq > after_seq {
                    entries.push(entry);
                }
            }
            return Ok(entries);
        };

        let Some(first) = after_seq.checked_add(1) else {
            return Ok(entries);
        };
        let prefix = key_prefix(key)?;
        let start_key = entry_key(key, first)?;

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (k, value) = item?;
            // Stop once we leave this document's key range
            if !k.starts_with(&prefix) || k.len() != prefix.len() + 8 {
                break;
            }
            entries.push(StoredValue::decode(kind, &value)?);
        }

        Ok(entries)
    }

    fn delete_through(
        &self,
        kind: EntryKind,
        key: &DocumentKey,
        through_seq: u64,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(kind)?;
        let prefix = key_prefix(key)?;
        let start_key = entry_key(key, 0)?;
        let end_key = entry_key(key, through_seq)?;

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(&prefix) || k.as_ref() > end_key.as_slice() {
                break;
            }
            batch.delete_cf(&cf, &k);
            count += 1;
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }
}

/// Length-prefixed (wave_id, blip_id).
fn key_prefix(key: &DocumentKey) -> Result<Vec<u8>, StoreError> {
    let wave = key.wave_id.as_bytes();
    let blip = key.blip_id.as_bytes();
    let wave_len = u16::try_from(wave.len())
        .map_err(|_| StoreError::Serialization(format!("wave id too long: {}", wave.len())))?;
    let blip_len = u16::try_from(blip.len())
        .map_err(|_| StoreError::Serialization(format!("blip id too long: {}", blip.len())))?;

    let mut prefix = Vec::with_capacity(4 + wave.len() + blip.len() + 8);
    prefix.extend_from_slice(&wave_len.to_be_bytes());
    prefix.extend_from_slice(wave);
    prefix.extend_from_slice(&blip_len.to_be_bytes());
    prefix.extend_from_slice(blip);
    Ok(prefix)
}

fn entry_key(key: &DocumentKey, seq: u64) -> Result<Vec<u8>, StoreError> {
    let mut k = key_prefix(key)?;
    k.extend_from_slice(&seq.to_be_bytes());
    Ok(k)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
