//! RocksDB-backed durable component rows.
//!
//! Row-oriented storage for canvas components, one row per component:
//!
//! Column families:
//! - `components` — key = page id (16 bytes) ‖ component id (16 bytes),
//!   value = LZ4-compressed bincode [`ComponentRecord`]
//! - `pages`      — per-page metadata (row count, timestamps)
//!
//! Text fields are stored in their flattened string form; CRDT history is
//! not persisted. Rows for one page are contiguous under the page-id key
//! prefix, so loads and reconciliation diffs are single prefix scans.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use inkpad_core::ComponentRecord;

/// Column family names.
const CF_COMPONENTS: &str = "components";
const CF_PAGES: &str = "pages";

const COLUMN_FAMILIES: &[&str] = &[CF_COMPONENTS, CF_PAGES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inkpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

/// Per-page metadata stored alongside component rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page_id: Uuid,
    /// Number of component rows currently stored for the page.
    pub component_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last flush timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl PageMetadata {
    fn new(page_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            page_id,
            component_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Page has no metadata row
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Page not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed component row store.
pub struct ComponentStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl ComponentStore {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
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

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_COMPONENTS => {
                // Rows are prefix-scanned by page id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_PAGES => {
                // Small values, point lookups
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Component rows ───────────────────────────────────────────────

    /// Load all component rows for a page, ordered by `z_index` ascending.
    pub fn load_components(&self, page_id: Uuid) -> Result<Vec<ComponentRecord>, StoreError> {
        let cf = self.cf(CF_COMPONENTS)?;
        let prefix = page_id.as_bytes().to_vec();

        let mut records = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 32 || &key[..16] != page_id.as_bytes() {
                break;
            }
            records.push(decode_row(&value)?);
        }

        records.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// All component ids currently stored for a page.
    pub fn component_ids(&self, page_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_COMPONENTS)?;
        let prefix = page_id.as_bytes().to_vec();

        let mut ids = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 32 || &key[..16] != page_id.as_bytes() {
                break;
            }
            let id = Uuid::from_bytes(
                key[16..32]
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("Invalid row key".into()))?,
            );
            ids.push(id);
        }
        Ok(ids)
    }

    /// Insert or overwrite one component row.
    pub fn upsert_component(
        &self,
        page_id: Uuid,
        record: &ComponentRecord,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_COMPONENTS)?;
        let key = row_key(page_id, record.id);
        let value = encode_row(record)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, key, value, &write_opts)?;
        Ok(())
    }

    /// Hard-delete component rows. Absent ids are ignored.
    pub fn delete_components(&self, page_id: Uuid, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_COMPONENTS)?;
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(&cf, row_key(page_id, *id));
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Delete a page's rows and metadata entirely.
    pub fn delete_page(&self, page_id: Uuid) -> Result<(), StoreError> {
        let ids = self.component_ids(page_id)?;
        self.delete_components(page_id, &ids)?;
        let cf_pages = self.cf(CF_PAGES)?;
        self.db.delete_cf(&cf_pages, page_id.as_bytes())?;
        Ok(())
    }

    // ─── Page metadata ────────────────────────────────────────────────

    /// Load page metadata.
    pub fn page_metadata(&self, page_id: Uuid) -> Result<PageMetadata, StoreError> {
        let cf = self.cf(CF_PAGES)?;
        match self.db.get_cf(&cf, page_id.as_bytes())? {
            Some(bytes) => PageMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(page_id)),
        }
    }

    /// Recount a page's rows and stamp its metadata. Called once per flush.
    pub fn update_page_metadata(&self, page_id: Uuid) -> Result<PageMetadata, StoreError> {
        let count = self.component_ids(page_id)?.len() as u64;
        let mut meta = self
            .page_metadata(page_id)
            .unwrap_or_else(|_| PageMetadata::new(page_id));
        meta.component_count = count;
        meta.updated_at = unix_now();

        let cf = self.cf(CF_PAGES)?;
        self.db.put_cf(&cf, page_id.as_bytes(), meta.encode()?)?;
        Ok(meta)
    }

    /// Whether any metadata exists for a page.
    pub fn page_exists(&self, page_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_PAGES)?;
        Ok(self.db.get_cf(&cf, page_id.as_bytes())?.is_some())
    }

    /// List all page ids with stored metadata.
    pub fn list_pages(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_PAGES)?;
        let mut page_ids = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::DeserializationError("Invalid page key".into()))?,
                );
                page_ids.push(id);
            }
        }
        Ok(page_ids)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// Row key: page id (16 bytes) ‖ component id (16 bytes).
fn row_key(page_id: Uuid, component_id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(page_id.as_bytes());
    key.extend_from_slice(component_id.as_bytes());
    key
}

fn encode_row(record: &ComponentRecord) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode_row(bytes: &[u8]) -> Result<ComponentRecord, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(record)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
