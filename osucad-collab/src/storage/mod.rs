//! Persistent storage for documents, versions and operation history.
//!
//! ```text
//! ┌─────────────┐  summaries   ┌──────────────────────────────────────┐
//! │ Room        │ ───────────► │ StorageBackend                       │
//! │ (server)    │  ops         │  documents  id → DocumentRecord      │
//! └─────────────┘ ───────────► │  commits    id:seq → StoredCommit    │
//!                              │  blobs      blake3 → contents        │
//!                              │  ops        id:seq → Operation (LZ4) │
//!                              └──────────────────────────────────────┘
//! ```
//!
//! A summary is stored content-addressed: every blob is keyed by its
//! blake3 hash, so objects that did not change between two versions are
//! stored once. Handles in an incremental summary are resolved against
//! the parent commit before anything is written.
//!
//! Backends are synchronous and shared as `Arc<dyn StorageBackend>`.

pub mod memory;
pub mod oplog;
pub mod rocks;

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::op::{DocumentId, Operation};
use crate::summary::{BlobEncoding, SummaryError, SummaryObject, SummaryTree};

pub use memory::MemoryStorage;
pub use oplog::{CompressedOperation, OperationLog, OperationLogStats};
pub use rocks::{RocksStorage, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(DocumentId),
    #[error("Version {sha} not found for document {document}")]
    VersionNotFound { document: DocumentId, sha: String },
    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentId),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Storage lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<SummaryError> for StoreError {
    fn from(e: SummaryError) -> Self {
        match e {
            SummaryError::UnresolvedHandle(path) => StoreError::InvalidHandle(path),
            other => StoreError::Deserialization(other.to_string()),
        }
    }
}

/// Head pointer of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub created_at: u64,
    /// Sha of the latest commit.
    pub head: String,
    pub sequence_number: u64,
}

/// Version listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub parent: Option<String>,
    pub sequence_number: u64,
    pub created_at: u64,
}

/// A version with its fully resolved summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub info: CommitInfo,
    pub document_id: DocumentId,
    pub tree: SummaryTree,
}

pub trait StorageBackend: Send + Sync {
    /// Store the first version of a new document.
    fn create_document(
        &self,
        id: DocumentId,
        summary: &SummaryTree,
        sequence_number: u64,
    ) -> Result<DocumentRecord, StoreError>;

    fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    fn list_documents(&self) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Store a new version on top of the head. Handles in `summary` are
    /// resolved against the head commit. Operations up to
    /// `sequence_number` are compacted away.
    fn create_version(
        &self,
        id: DocumentId,
        summary: &SummaryTree,
        sequence_number: u64,
    ) -> Result<CommitInfo, StoreError>;

    fn get_latest_version(&self, id: DocumentId) -> Result<Option<Commit>, StoreError>;

    fn get_version(&self, id: DocumentId, sha: &str) -> Result<Commit, StoreError>;

    /// Versions of a document, newest first.
    fn list_versions(&self, id: DocumentId) -> Result<Vec<CommitInfo>, StoreError>;

    fn append_operations(&self, id: DocumentId, ops: &[Operation]) -> Result<(), StoreError>;

    /// Operations with a sequence number above `after`, in order.
    fn operations_since(&self, id: DocumentId, after: u64) -> Result<Vec<Operation>, StoreError>;
}

// ─── Content addressing ───────────────────────────────────────────────

/// Summary tree with blob contents replaced by their hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTree {
    pub entries: BTreeMap<String, StoredNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredNode {
    Tree(StoredTree),
    Blob { hash: String, encoding: BlobEncoding },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCommit {
    pub sha: String,
    pub parent: Option<String>,
    pub document_id: DocumentId,
    pub sequence_number: u64,
    pub created_at: u64,
    pub tree: StoredTree,
}

impl StoredCommit {
    pub fn info(&self) -> CommitInfo {
        CommitInfo {
            sha: self.sha.clone(),
            parent: self.parent.clone(),
            sequence_number: self.sequence_number,
            created_at: self.created_at,
        }
    }
}

#[derive(Serialize)]
struct CommitHeader<'a> {
    parent: &'a Option<String>,
    document_id: &'a DocumentId,
    sequence_number: u64,
    created_at: u64,
    tree: &'a StoredTree,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

pub(crate) fn compress(bytes: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(bytes)
}

pub(crate) fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Split a resolved summary into a stored tree plus `(hash, contents)`
/// blobs.
pub(crate) fn split_tree(
    tree: &SummaryTree,
    blobs: &mut Vec<(String, Vec<u8>)>,
) -> Result<StoredTree, StoreError> {
    let mut entries = BTreeMap::new();
    for (name, object) in &tree.tree {
        let node = match object {
            SummaryObject::Tree(subtree) => StoredNode::Tree(split_tree(subtree, blobs)?),
            SummaryObject::Blob { contents, encoding } => {
                let hash = blake3::hash(contents.as_bytes()).to_hex().to_string();
                blobs.push((hash.clone(), contents.as_bytes().to_vec()));
                StoredNode::Blob {
                    hash,
                    encoding: *encoding,
                }
            }
            SummaryObject::Handle { reference } => {
                return Err(StoreError::InvalidHandle(reference.clone()));
            }
        };
        entries.insert(name.clone(), node);
    }
    Ok(StoredTree { entries })
}

/// Rebuild a summary from a stored tree.
pub(crate) fn join_tree(
    stored: &StoredTree,
    blob: &impl Fn(&str) -> Result<Vec<u8>, StoreError>,
) -> Result<SummaryTree, StoreError> {
    let mut tree = SummaryTree::new();
    for (name, node) in &stored.entries {
        let object = match node {
            StoredNode::Tree(subtree) => SummaryObject::Tree(join_tree(subtree, blob)?),
            StoredNode::Blob { hash, encoding } => {
                let contents = String::from_utf8(blob(hash)?)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                SummaryObject::Blob {
                    contents,
                    encoding: *encoding,
                }
            }
        };
        tree.insert(name.clone(), object);
    }
    Ok(tree)
}

/// Build a commit for `summary`, resolving handles against `parent_tree`.
/// Returns the commit and the blobs to store.
pub(crate) fn build_commit(
    document_id: DocumentId,
    summary: &SummaryTree,
    sequence_number: u64,
    parent: Option<String>,
    parent_tree: Option<&SummaryTree>,
) -> Result<(StoredCommit, Vec<(String, Vec<u8>)>), StoreError> {
    let resolved = if summary.contains_handles() {
        summary.resolve_handles(parent_tree)?
    } else {
        summary.clone()
    };
    let mut blobs = Vec::new();
    let tree = split_tree(&resolved, &mut blobs)?;
    let created_at = unix_now();
    let header = CommitHeader {
        parent: &parent,
        document_id: &document_id,
        sequence_number,
        created_at,
        tree: &tree,
    };
    let sha = blake3::hash(&encode(&header)?).to_hex().to_string();
    Ok((
        StoredCommit {
            sha,
            parent,
            document_id,
            sequence_number,
            created_at,
            tree,
        },
        blobs,
    ))
}
