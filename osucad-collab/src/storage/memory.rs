//! In-memory storage backend, for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::op::{DocumentId, Operation};
use crate::summary::SummaryTree;

use super::{
    build_commit, join_tree, unix_now, Commit, CommitInfo, DocumentRecord, OperationLog,
    StorageBackend, StoreError, StoredCommit,
};

#[derive(Default)]
struct State {
    documents: HashMap<DocumentId, DocumentRecord>,
    commits: HashMap<String, StoredCommit>,
    blobs: HashMap<String, Vec<u8>>,
    ops: HashMap<DocumentId, OperationLog>,
}

impl State {
    fn resolve(&self, commit: &StoredCommit) -> Result<Commit, StoreError> {
        let tree = join_tree(&commit.tree, &|hash| {
            self.blobs
                .get(hash)
                .cloned()
                .ok_or_else(|| StoreError::InvalidHandle(format!("missing blob {hash}")))
        })?;
        Ok(Commit {
            info: commit.info(),
            document_id: commit.document_id,
            tree,
        })
    }

    fn insert_commit(&mut self, commit: StoredCommit, blobs: Vec<(String, Vec<u8>)>) {
        for (hash, contents) in blobs {
            self.blobs.entry(hash).or_insert(contents);
        }
        self.commits.insert(commit.sha.clone(), commit);
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct blobs held, across all documents.
    pub fn blob_count(&self) -> usize {
        self.read().map(|s| s.blobs.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }
}

impl StorageBackend for MemoryStorage {
    fn create_document(
        &self,
        id: DocumentId,
        summary: &SummaryTree,
        sequence_number: u64,
    ) -> Result<DocumentRecord, StoreError> {
        let mut state = self.write()?;
        if state.documents.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        let (commit, blobs) = build_commit(id, summary, sequence_number, None, None)?;
        let record = DocumentRecord {
            id,
            created_at: unix_now(),
            head: commit.sha.clone(),
            sequence_number,
        };
        state.insert_commit(commit, blobs);
        state.documents.insert(id, record.clone());
        Ok(record)
    }

    fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    fn list_documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut records: Vec<DocumentRecord> = self.read()?.documents.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn create_version(
        &self,
        id: DocumentId,
        summary: &SummaryTree,
        sequence_number: u64,
    ) -> Result<CommitInfo, StoreError> {
        let mut state = self.write()?;
        let head = state
            .documents
            .get(&id)
            .map(|r| r.head.clone())
            .ok_or(StoreError::NotFound(id))?;

        let parent_tree = if summary.contains_handles() {
            let commit = state
                .commits
                .get(&head)
                .ok_or_else(|| StoreError::VersionNotFound {
                    document: id,
                    sha: head.clone(),
                })?;
            Some(state.resolve(commit)?.tree)
        } else {
            None
        };

        let (commit, blobs) =
            build_commit(id, summary, sequence_number, Some(head), parent_tree.as_ref())?;
        let info = commit.info();
        state.insert_commit(commit, blobs);
        if let Some(record) = state.documents.get_mut(&id) {
            record.head = info.sha.clone();
            record.sequence_number = sequence_number;
        }
        if let Some(log) = state.ops.get_mut(&id) {
            log.compact(sequence_number);
        }
        Ok(info)
    }

    fn get_latest_version(&self, id: DocumentId) -> Result<Option<Commit>, StoreError> {
        let state = self.read()?;
        let Some(record) = state.documents.get(&id) else {
            return Ok(None);
        };
        match state.commits.get(&record.head) {
            Some(commit) => Ok(Some(state.resolve(commit)?)),
            None => Err(StoreError::VersionNotFound {
                document: id,
                sha: record.head.clone(),
            }),
        }
    }

    fn get_version(&self, id: DocumentId, sha: &str) -> Result<Commit, StoreError> {
        let state = self.read()?;
        match state.commits.get(sha) {
            Some(commit) if commit.document_id == id => state.resolve(commit),
            _ => Err(StoreError::VersionNotFound {
                document: id,
                sha: sha.to_string(),
            }),
        }
    }

    fn list_versions(&self, id: DocumentId) -> Result<Vec<CommitInfo>, StoreError> {
        let state = self.read()?;
        let record = state.documents.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut versions = Vec::new();
        let mut next = Some(record.head.clone());
        while let Some(sha) = next {
            let commit = state
                .commits
                .get(&sha)
                .ok_or(StoreError::VersionNotFound { document: id, sha })?;
            next = commit.parent.clone();
            versions.push(commit.info());
        }
        Ok(versions)
    }

    fn append_operations(&self, id: DocumentId, ops: &[Operation]) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.ops.entry(id).or_default().append(ops)?;
        Ok(())
    }

    fn operations_since(&self, id: DocumentId, after: u64) -> Result<Vec<Operation>, StoreError> {
        match self.read()?.ops.get(&id) {
            Some(log) => log.since(after),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{MutationPayload, ObjectId};
    use crate::op::Mutation;
    use crate::summary::SummaryObject;
    use uuid::Uuid;

    fn summary(title: &str) -> SummaryTree {
        let mut objects = SummaryTree::new();
        objects.insert("metadata", SummaryObject::utf8(title));
        objects.insert("general", SummaryObject::utf8("unchanged"));
        let mut root = SummaryTree::new();
        root.insert("objects", SummaryObject::Tree(objects));
        root
    }

    fn op(seq: u64) -> Operation {
        Operation {
            sequence_number: seq,
            reference_sequence_number: 0,
            mutation: Mutation {
                target: ObjectId::new("metadata"),
                payload: MutationPayload::set("title", "x"),
                client_id: Uuid::nil(),
                local_sequence: seq,
            },
        }
    }

    #[test]
    fn test_create_version_dedups_blobs() {
        let store = MemoryStorage::new();
        let id = Uuid::new_v4();
        store.create_document(id, &summary("a"), 0).unwrap();
        assert_eq!(store.blob_count(), 2);

        store.create_version(id, &summary("b"), 1).unwrap();
        // Only the changed blob is new.
        assert_eq!(store.blob_count(), 3);

        let versions = store.list_versions(id).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].sequence_number, 1);
        assert_eq!(store.get_document(id).unwrap().unwrap().head, versions[0].sha);
    }

    #[test]
    fn test_incremental_version_with_missing_base() {
        let store = MemoryStorage::new();
        let id = Uuid::new_v4();
        store.create_document(id, &summary("a"), 0).unwrap();

        let mut root = SummaryTree::new();
        root.insert("nothing", SummaryObject::handle("/objects/nothing"));
        assert!(matches!(
            store.create_version(id, &root, 1),
            Err(StoreError::InvalidHandle(_))
        ));
        assert_eq!(store.list_versions(id).unwrap().len(), 1);
    }

    #[test]
    fn test_ops_compacted_by_version() {
        let store = MemoryStorage::new();
        let id = Uuid::new_v4();
        store.create_document(id, &summary("a"), 0).unwrap();
        store
            .append_operations(id, &(1..=4).map(op).collect::<Vec<_>>())
            .unwrap();
        store.create_version(id, &summary("b"), 2).unwrap();
        assert_eq!(store.operations_since(id, 0).unwrap(), vec![op(3), op(4)]);
        assert!(store.operations_since(Uuid::new_v4(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_list_documents() {
        let store = MemoryStorage::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create_document(a, &summary("a"), 0).unwrap();
        store.create_document(b, &summary("b"), 0).unwrap();
        let ids: Vec<_> = store.list_documents().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
    }
}
