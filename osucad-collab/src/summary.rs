//! Summary trees: the persisted form of a document.
//!
//! ```text
//! tree
//!  ├── ".attributes"  blob (utf-8 JSON: documentId, sequenceNumber, createTime, root, clientSequences)
//!  └── "objects"      tree
//!        ├── "<id>"   blob (base64 bincode ObjectRecord)
//!        └── "<id>"   handle "/objects/<id>"   (unchanged since the previous summary)
//! ```
//!
//! Handles point into the previous commit's tree and are resolved by the
//! storage backend when the summary is stored.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::object::{ObjectId, ObjectSnapshot};
use crate::op::{ClientId, DocumentId};

pub const ATTRIBUTES_BLOB: &str = ".attributes";
pub const OBJECTS_TREE: &str = "objects";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryObject {
    Tree(SummaryTree),
    Blob {
        contents: String,
        encoding: BlobEncoding,
    },
    Handle {
        #[serde(rename = "ref")]
        reference: String,
    },
}

impl SummaryObject {
    pub fn utf8(contents: impl Into<String>) -> Self {
        SummaryObject::Blob {
            contents: contents.into(),
            encoding: BlobEncoding::Utf8,
        }
    }

    pub fn base64(bytes: &[u8]) -> Self {
        SummaryObject::Blob {
            contents: base64::engine::general_purpose::STANDARD.encode(bytes),
            encoding: BlobEncoding::Base64,
        }
    }

    pub fn handle(path: impl Into<String>) -> Self {
        SummaryObject::Handle {
            reference: path.into(),
        }
    }

    /// Raw bytes of a blob. Fails on trees and handles.
    pub fn blob_bytes(&self) -> Result<Vec<u8>, SummaryError> {
        match self {
            SummaryObject::Blob {
                contents,
                encoding: BlobEncoding::Utf8,
            } => Ok(contents.as_bytes().to_vec()),
            SummaryObject::Blob {
                contents,
                encoding: BlobEncoding::Base64,
            } => base64::engine::general_purpose::STANDARD
                .decode(contents)
                .map_err(|e| SummaryError::InvalidEncoding(e.to_string())),
            SummaryObject::Tree(_) => Err(SummaryError::NotABlob("tree".into())),
            SummaryObject::Handle { reference } => Err(SummaryError::UnresolvedHandle(reference.clone())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryTree {
    pub tree: BTreeMap<String, SummaryObject>,
}

impl SummaryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, object: SummaryObject) {
        self.tree.insert(name.into(), object);
    }

    pub fn get(&self, name: &str) -> Option<&SummaryObject> {
        self.tree.get(name)
    }

    /// Look up a `/`-separated path such as `/objects/abc`.
    pub fn get_path(&self, path: &str) -> Option<&SummaryObject> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = segments.next()?;
        let mut current = self.tree.get(first)?;
        for segment in segments {
            match current {
                SummaryObject::Tree(subtree) => current = subtree.tree.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn contains_handles(&self) -> bool {
        self.tree.values().any(|object| match object {
            SummaryObject::Handle { .. } => true,
            SummaryObject::Tree(subtree) => subtree.contains_handles(),
            SummaryObject::Blob { .. } => false,
        })
    }

    /// Replace every handle with the object it references in `base`.
    pub fn resolve_handles(&self, base: Option<&SummaryTree>) -> Result<SummaryTree, SummaryError> {
        let mut resolved = SummaryTree::new();
        for (name, object) in &self.tree {
            let object = match object {
                SummaryObject::Handle { reference } => {
                    let target = base
                        .and_then(|b| b.get_path(reference))
                        .ok_or_else(|| SummaryError::UnresolvedHandle(reference.clone()))?;
                    if let SummaryObject::Handle { .. } = target {
                        return Err(SummaryError::UnresolvedHandle(reference.clone()));
                    }
                    target.clone()
                }
                SummaryObject::Tree(subtree) => SummaryObject::Tree(subtree.resolve_handles(base)?),
                blob => blob.clone(),
            };
            resolved.tree.insert(name.clone(), object);
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SummaryError {
    #[error("summary is missing `{0}`")]
    MissingEntry(String),
    #[error("expected a blob, found a {0}")]
    NotABlob(String),
    #[error("invalid blob encoding: {0}")]
    InvalidEncoding(String),
    #[error("unresolved handle `{0}`")]
    UnresolvedHandle(String),
    #[error("invalid attributes: {0}")]
    Attributes(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttributes {
    pub document_id: DocumentId,
    pub sequence_number: u64,
    pub create_time: u64,
    pub root: Option<ObjectId>,
    /// Highest local sequence number sequenced from each client.
    #[serde(default)]
    pub client_sequences: BTreeMap<ClientId, u64>,
}

/// One object inside a summary, with its owning list if it is a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub snapshot: ObjectSnapshot,
    pub parent: Option<ObjectId>,
}

/// Decoded document summary.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSummary {
    pub attributes: DocumentAttributes,
    pub objects: Vec<ObjectRecord>,
}

impl DocumentSummary {
    /// Build a tree. Objects for which `unchanged` returns true are written
    /// as handles into the previous summary.
    pub fn to_tree(&self, unchanged: impl Fn(&ObjectId) -> bool) -> Result<SummaryTree, SummaryError> {
        let attributes = serde_json::to_string(&self.attributes)
            .map_err(|e| SummaryError::Attributes(e.to_string()))?;

        let mut objects = SummaryTree::new();
        for record in &self.objects {
            let id = &record.snapshot.id;
            let node = if unchanged(id) {
                SummaryObject::handle(format!("/{OBJECTS_TREE}/{id}"))
            } else {
                SummaryObject::base64(&codec::to_bytes(record)?)
            };
            objects.insert(id.as_str(), node);
        }

        let mut root = SummaryTree::new();
        root.insert(ATTRIBUTES_BLOB, SummaryObject::utf8(attributes));
        root.insert(OBJECTS_TREE, SummaryObject::Tree(objects));
        Ok(root)
    }

    /// Decode a fully resolved tree.
    pub fn from_tree(tree: &SummaryTree) -> Result<Self, SummaryError> {
        let attributes_blob = tree
            .get(ATTRIBUTES_BLOB)
            .ok_or_else(|| SummaryError::MissingEntry(ATTRIBUTES_BLOB.into()))?
            .blob_bytes()?;
        let attributes: DocumentAttributes = serde_json::from_slice(&attributes_blob)
            .map_err(|e| SummaryError::Attributes(e.to_string()))?;

        let objects_tree = match tree.get(OBJECTS_TREE) {
            Some(SummaryObject::Tree(t)) => t,
            Some(_) => return Err(SummaryError::MissingEntry(format!("{OBJECTS_TREE} tree"))),
            None => return Err(SummaryError::MissingEntry(OBJECTS_TREE.into())),
        };

        let objects = objects_tree
            .tree
            .values()
            .map(|node| {
                let bytes = node.blob_bytes()?;
                Ok(codec::from_bytes::<ObjectRecord>(&bytes)?)
            })
            .collect::<Result<Vec<_>, SummaryError>>()?;

        Ok(Self {
            attributes,
            objects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use uuid::Uuid;

    fn summary() -> DocumentSummary {
        let mut entries = BTreeMap::new();
        entries.insert("title".to_string(), Value::from("song"));
        DocumentSummary {
            attributes: DocumentAttributes {
                document_id: Uuid::new_v4(),
                sequence_number: 12,
                create_time: 1_700_000_000,
                root: Some(ObjectId::new("root")),
                client_sequences: BTreeMap::from([(Uuid::nil(), 4)]),
            },
            objects: vec![ObjectRecord {
                snapshot: ObjectSnapshot::map(ObjectId::new("root"), "map", entries),
                parent: None,
            }],
        }
    }

    #[test]
    fn test_tree_roundtrip() {
        let original = summary();
        let tree = original.to_tree(|_| false).unwrap();
        assert!(!tree.contains_handles());
        assert_eq!(DocumentSummary::from_tree(&tree).unwrap(), original);
    }

    #[test]
    fn test_attributes_are_readable_json() {
        let tree = summary().to_tree(|_| false).unwrap();
        let bytes = tree.get(ATTRIBUTES_BLOB).unwrap().blob_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"sequenceNumber\":12"));
    }

    #[test]
    fn test_handles_resolve_against_base() {
        let base = summary().to_tree(|_| false).unwrap();
        let incremental = summary().to_tree(|_| true).unwrap();
        assert!(incremental.contains_handles());
        assert!(DocumentSummary::from_tree(&incremental).is_err());

        let resolved = incremental.resolve_handles(Some(&base)).unwrap();
        assert_eq!(
            resolved.get_path("/objects/root"),
            base.get_path("/objects/root")
        );
    }

    #[test]
    fn test_dangling_handle_is_an_error() {
        let incremental = summary().to_tree(|_| true).unwrap();
        assert_eq!(
            incremental.resolve_handles(None).unwrap_err(),
            SummaryError::UnresolvedHandle("/objects/root".into())
        );
    }
}
