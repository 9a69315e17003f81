//! RocksDB-backed key-value backend.
//!
//! Column families, one per namespace:
//! - `workflows`    — saved submissions, keyed by UUID string
//! - `user`         — the local profile (`profile`)
//! - `syncQueue`    — pending outbound mutations
//! - `integrations` — configured third-party integrations
//!
//! Values arrive already LZ4-compressed from [`super::encode_value`], so the
//! column families themselves are left uncompressed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{KeyValueBackend, Namespace, StoreError, StoreKey};

#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true; the queue must survive a crash)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowdoc_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksBackend {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Namespace::ALL
            .iter()
            .map(|ns| ColumnFamilyDescriptor::new(ns.as_str(), Self::cf_options(*ns, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("opened store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(namespace: Namespace, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match namespace {
            Namespace::Workflows => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            // Small, short-lived entries written on every local change.
            Namespace::SyncQueue => {
                opts.set_max_write_buffer_number(4);
            }
            Namespace::User | Namespace::Integrations => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, namespace: Namespace) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(namespace.as_str())
            .ok_or_else(|| StoreError::Database(format!("column family '{}' not found", namespace.as_str())))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn scan(&self, namespace: Namespace) -> Result<Vec<(StoreKey, Vec<u8>)>, StoreError> {
        let cf = self.cf(namespace)?;
        let mut out = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = entry?;
            match std::str::from_utf8(&key) {
                Ok(id) => out.push((StoreKey::new(namespace, id), value.into_vec())),
                Err(_) => log::warn!("skipping non-utf8 key in '{}'", namespace.as_str()),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl KeyValueBackend for RocksBackend {
    async fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        let cf = self.cf(key.namespace)?;
        self.db.put_cf_opt(cf, key.id.as_bytes(), &value, &self.write_opts())?;
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(key.namespace)?;
        Ok(self.db.get_cf(cf, key.id.as_bytes())?)
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let cf = self.cf(key.namespace)?;
        self.db.delete_cf_opt(cf, key.id.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    async fn entries(&self, namespace: Namespace) -> Result<Vec<(StoreKey, Vec<u8>)>, StoreError> {
        self.scan(namespace)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for ns in Namespace::ALL {
            let cf = self.cf(ns)?;
            for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = entry?;
                batch.delete_cf(cf, key);
            }
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}
