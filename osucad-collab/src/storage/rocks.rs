//! RocksDB-backed document storage.
//!
//! Column families:
//! - `documents`: `doc_id` → `DocumentRecord` (bincode)
//! - `commits`  : `sha` → `StoredCommit` (bincode, LZ4 compressed)
//! - `blobs`    : blake3 hash → blob contents (LZ4 compressed)
//! - `ops`      : `doc_id:seq` → `Operation` (LZ4 compressed)
//!
//! Versions form a parent chain starting at the document head, so
//! listing versions walks the chain instead of scanning.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use crate::codec::{decode_operation, encode_operation};
use crate::op::{DocumentId, Operation};
use crate::summary::SummaryTree;

use super::{
    build_commit, compress, decode, decompress, encode, join_tree, unix_now, Commit, CommitInfo,
    DocumentRecord, StorageBackend, StoreError, StoredCommit,
};

const CF_DOCUMENTS: &str = "documents";
const CF_COMMITS: &str = "commits";
const CF_BLOBS: &str = "blobs";
const CF_OPS: &str = "ops";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_COMMITS, CF_BLOBS, CF_OPS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("osucad_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes head updates.
    write_lock: Mutex<()>,
}

impl RocksStorage {
    /// Open the store, creating the database and column families if missing.
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
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_COMMITS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BLOBS => {
                // Values are LZ4 compressed already.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPS => {
                // Many small writes, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// doc_id (16 bytes) + sequence number (8 bytes big-endian).
    fn op_key(doc_id: DocumentId, sequence_number: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&sequence_number.to_be_bytes());
        key
    }

    fn load_commit(&self, sha: &str) -> Result<Option<StoredCommit>, StoreError> {
        let cf = self.cf(CF_COMMITS)?;
        match self.db.get_cf(cf, sha.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&decompress(&bytes)?)?)),
            None => Ok(None),
        }
    }

    fn load_blob(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        match self.db.get_cf(cf, hash.as_bytes())? {
            Some(bytes) => decompress(&bytes),
            None => Err(StoreError::InvalidHandle(format!("missing blob {hash}"))),
        }
    }

    fn resolve(&self, commit: StoredCommit) -> Result<Commit, StoreError> {
        let tree = join_tree(&commit.tree, &|hash| self.load_blob(hash))?;
        Ok(Commit {
            info: commit.info(),
            document_id: commit.document_id,
            tree,
        })
    }

    /// Queue a commit and its new blobs on `batch`.
    fn put_commit(
        &self,
        batch: &mut WriteBatch,
        commit: &StoredCommit,
        blobs: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StoreError> {
        let cf_blobs = self.cf(CF_BLOBS)?;
        for (hash, contents) in blobs {
            if self.db.get_pinned_cf(cf_blobs, hash.as_bytes())?.is_none() {
                batch.put_cf(cf_blobs, hash.as_bytes(), compress(&contents));
            }
        }
        let cf_commits = self.cf(CF_COMMITS)?;
        batch.put_cf(cf_commits, commit.sha.as_bytes(), compress(&encode(commit)?));
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl StorageBackend for RocksStorage {
    fn create_document(
        &self,
        id: DocumentId,
        summary: &SummaryTree,
        sequence_number: u64,
    ) -> Result<DocumentRecord, StoreError> {
        let _guard = self.lock()?;
        if self.get_document(id)?.is_some() {
            return Err(StoreError::AlreadyExists(id));
        }

        let (commit, blobs) = build_commit(id, summary, sequence_number, None, None)?;
        let record = DocumentRecord {
            id,
            created_at: unix_now(),
            head: commit.sha.clone(),
            sequence_number,
        };

        let mut batch = WriteBatch::default();
        self.put_commit(&mut batch, &commit, blobs)?;
        batch.put_cf(self.cf(CF_DOCUMENTS)?, id.as_bytes(), encode(&record)?);
        self.write(batch)?;

        log::debug!("Created document {id} at sequence {sequence_number}");
        Ok(record)
    }

    fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    fn create_version(
        &self,
        id: DocumentId,
        summary: &SummaryTree,
        sequence_number: u64,
    ) -> Result<CommitInfo, StoreError> {
        let _guard = self.lock()?;
        let mut record = self.get_document(id)?.ok_or(StoreError::NotFound(id))?;

        let parent_tree = if summary.contains_handles() {
            let head = self
                .load_commit(&record.head)?
                .ok_or_else(|| StoreError::VersionNotFound {
                    document: id,
                    sha: record.head.clone(),
                })?;
            Some(self.resolve(head)?.tree)
        } else {
            None
        };

        let (commit, blobs) = build_commit(
            id,
            summary,
            sequence_number,
            Some(record.head.clone()),
            parent_tree.as_ref(),
        )?;
        record.head = commit.sha.clone();
        record.sequence_number = sequence_number;

        let mut batch = WriteBatch::default();
        self.put_commit(&mut batch, &commit, blobs)?;
        batch.put_cf(self.cf(CF_DOCUMENTS)?, id.as_bytes(), encode(&record)?);
        batch.delete_range_cf(
            self.cf(CF_OPS)?,
            Self::op_key(id, 0),
            Self::op_key(id, sequence_number.saturating_add(1)),
        );
        self.write(batch)?;

        log::debug!("Stored version {} of {id} at sequence {sequence_number}", commit.sha);
        Ok(commit.info())
    }

    fn get_latest_version(&self, id: DocumentId) -> Result<Option<Commit>, StoreError> {
        let Some(record) = self.get_document(id)? else {
            return Ok(None);
        };
        match self.load_commit(&record.head)? {
            Some(commit) => Ok(Some(self.resolve(commit)?)),
            None => Err(StoreError::VersionNotFound {
                document: id,
                sha: record.head,
            }),
        }
    }

    fn get_version(&self, id: DocumentId, sha: &str) -> Result<Commit, StoreError> {
        match self.load_commit(sha)? {
            Some(commit) if commit.document_id == id => self.resolve(commit),
            _ => Err(StoreError::VersionNotFound {
                document: id,
                sha: sha.to_string(),
            }),
        }
    }

    fn list_versions(&self, id: DocumentId) -> Result<Vec<CommitInfo>, StoreError> {
        let record = self.get_document(id)?.ok_or(StoreError::NotFound(id))?;
        let mut versions = Vec::new();
        let mut next = Some(record.head);
        while let Some(sha) = next {
            let commit = self
                .load_commit(&sha)?
                .ok_or(StoreError::VersionNotFound { document: id, sha })?;
            next = commit.parent.clone();
            versions.push(commit.info());
        }
        Ok(versions)
    }

    fn append_operations(&self, id: DocumentId, ops: &[Operation]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_OPS)?;
        let mut batch = WriteBatch::default();
        for op in ops {
            let bytes =
                encode_operation(op).map_err(|e| StoreError::Serialization(e.to_string()))?;
            batch.put_cf(cf, Self::op_key(id, op.sequence_number), compress(&bytes));
        }
        self.write(batch)
    }

    fn operations_since(&self, id: DocumentId, after: u64) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start_key = Self::op_key(id, start);

        let mut ops = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward))
        {
            let (key, value) = item?;
            // Stop once past this document's key prefix
            if key.len() < 24 || &key[..16] != id.as_bytes() {
                break;
            }
            let bytes = decompress(&value)?;
            ops.push(
                decode_operation(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))?,
            );
        }
        Ok(ops)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
