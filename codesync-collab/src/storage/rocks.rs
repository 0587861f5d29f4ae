//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — bincode records keyed by id (8 bytes big-endian), content LZ4 compressed
//! - `metadata`  — store-wide counters (`next_id`)
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{DocumentId, DocumentStore, StoreError, StoredDocument};
use crate::analysis::detect_language;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

const NEXT_ID_KEY: &[u8] = b"next_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codesync_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DocumentRecord {
    title: String,
    language: String,
    /// LZ4 (size-prepended) UTF-8 content
    content: Vec<u8>,
    /// Seconds since epoch
    updated_at: u64,
}

impl DocumentRecord {
    fn new(title: &str, language: &str, content: &str) -> Self {
        Self {
            title: title.to_string(),
            language: language.to_string(),
            content: lz4_flex::compress_prepend_size(content.as_bytes()),
            updated_at: now_secs(),
        }
    }

    fn set_content(&mut self, content: &str) {
        self.content = lz4_flex::compress_prepend_size(content.as_bytes());
        self.updated_at = now_secs();
    }

    fn into_document(self, id: DocumentId) -> Result<StoredDocument, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(&self.content)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let content = String::from_utf8(raw).map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(StoredDocument {
            id,
            title: self.title,
            content,
            language: self.language,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(record)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn id_key(id: DocumentId) -> [u8; 8] {
    id.to_be_bytes()
}

/// Durable document store.
pub struct RocksDocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes id allocation and read-modify-write updates
    write_lock: Mutex<()>,
}

impl RocksDocumentStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        // Content is already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn next_id(&self) -> Result<DocumentId, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, NEXT_ID_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(DocumentId::from_be_bytes(buf))
            }
            Some(_) => Err(StoreError::Codec("corrupt next_id".into())),
            None => Ok(1),
        }
    }

    fn record(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .get_cf(cf, id_key(id))?
            .map(|bytes| DocumentRecord::decode(&bytes))
            .transpose()
    }
}

impl DocumentStore for RocksDocumentStore {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        self.record(id)?
            .map(|record| record.into_document(id))
            .transpose()
    }

    fn save_content(&self, id: DocumentId, content: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut record = self.record(id)?.ok_or(StoreError::NotFound(id))?;
        record.set_content(content);
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .put_cf_opt(cf, id_key(id), record.encode()?, &self.write_options())?;
        Ok(())
    }

    fn insert(&self, title: &str, content: &str) -> Result<DocumentId, StoreError> {
        let _guard = self.write_lock.lock();
        let id = self.next_id()?;
        let language = detect_language(content, Some(title));
        let record = DocumentRecord::new(title, language, content);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, id_key(id), record.encode()?);
        batch.put_cf(self.cf(CF_METADATA)?, NEXT_ID_KEY, (id + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!("Stored document {id} ({title})");
        Ok(id)
    }
}
