//! Shared object model.
//!
//! A shared object is a uniquely identified, typed container owned by one
//! [`DocumentRuntime`](crate::runtime::DocumentRuntime). Its contents only
//! change through [`SharedObject::apply_mutation`]; the runtime is the
//! single caller, for local optimistic edits and sequenced remote ones
//! alike.
//!
//! ```text
//! DocumentRuntime
//!   ├── SharedMap "root"          key → Value
//!   ├── SharedSortedList "hitObjects"
//!   │     ├── SharedMap <id>      (child, sorted by "startTime")
//!   │     └── ...
//!   └── ...
//! ```

pub mod map;
pub mod registry;
pub mod sorted_list;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

pub use map::SharedMap;
pub use registry::{Constructor, TypeRegistry};
pub use sorted_list::{ListItem, SharedSortedList};

/// Identity of a shared object. Never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Object-type-specific mutation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationPayload {
    MapSet { key: String, value: Value },
    MapDelete { key: String },
    MapClear,
    /// Replace the whole map contents. Inverse of a clear.
    MapReplace { entries: BTreeMap<String, Value> },
    ListInsert { item: ObjectSnapshot },
    ListRemove { id: ObjectId },
}

impl MutationPayload {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        MutationPayload::MapSet {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        MutationPayload::MapDelete { key: key.into() }
    }

    /// Round every float carried by the payload.
    pub fn normalized(self) -> Self {
        match self {
            MutationPayload::MapSet { key, value } => MutationPayload::MapSet {
                key,
                value: value.normalized(),
            },
            MutationPayload::MapReplace { entries } => MutationPayload::MapReplace {
                entries: normalize_entries(entries),
            },
            MutationPayload::ListInsert { item } => MutationPayload::ListInsert {
                item: item.normalized(),
            },
            other => other,
        }
    }

    /// The key or item slot this payload touches, if it is slot-scoped.
    /// Whole-object payloads (clear, replace) return `None`.
    pub fn slot(&self) -> Option<&str> {
        match self {
            MutationPayload::MapSet { key, .. } | MutationPayload::MapDelete { key } => Some(key),
            MutationPayload::ListInsert { item } => Some(item.id.as_str()),
            MutationPayload::ListRemove { id } => Some(id.as_str()),
            MutationPayload::MapClear | MutationPayload::MapReplace { .. } => None,
        }
    }

    pub fn is_whole_object(&self) -> bool {
        matches!(
            self,
            MutationPayload::MapClear | MutationPayload::MapReplace { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MutationPayload::MapSet { .. } => "set",
            MutationPayload::MapDelete { .. } => "delete",
            MutationPayload::MapClear => "clear",
            MutationPayload::MapReplace { .. } => "replace",
            MutationPayload::ListInsert { .. } => "insert",
            MutationPayload::ListRemove { .. } => "remove",
        }
    }
}

fn normalize_entries(entries: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k, v.normalized()))
        .collect()
}

/// Serializable state of one shared object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub type_name: String,
    pub content: SnapshotContent,
}

impl ObjectSnapshot {
    pub fn map(
        id: ObjectId,
        type_name: impl Into<String>,
        entries: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            content: SnapshotContent::Map { entries },
        }
    }

    pub fn entries(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.content {
            SnapshotContent::Map { entries } => Some(entries),
            SnapshotContent::SortedList { .. } => None,
        }
    }

    pub fn normalized(self) -> Self {
        let ObjectSnapshot {
            id,
            type_name,
            content,
        } = self;
        let content = match content {
            SnapshotContent::Map { entries } => SnapshotContent::Map {
                entries: normalize_entries(entries),
            },
            list => list,
        };
        Self {
            id,
            type_name,
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotContent {
    Map {
        entries: BTreeMap<String, Value>,
    },
    SortedList {
        sort_by: String,
        items: Vec<ListItem>,
    },
}

/// What changed on an object, reported to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangedProperty {
    Key(String),
    Cleared,
    ItemInserted(ObjectId),
    ItemRemoved(ObjectId),
    ItemMoved(ObjectId),
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Change notification `{ object, property }` emitted after every
/// successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub object: ObjectId,
    pub property: ChangedProperty,
    pub origin: ChangeOrigin,
}

/// Result of applying one mutation to one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Payload that reverses this mutation, if it changed anything.
    pub inverse: Option<MutationPayload>,
    pub changes: Vec<ChangedProperty>,
    /// Child the runtime must instantiate and register.
    pub attached: Option<ObjectSnapshot>,
    /// Child the runtime must drop.
    pub detached: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObjectError {
    #[error("structural mismatch on {object}: {reason}")]
    StructuralMismatch { object: ObjectId, reason: String },
    #[error("{object} ({type_name}) cannot apply a {payload} mutation")]
    TypeMismatch {
        object: ObjectId,
        type_name: &'static str,
        payload: &'static str,
    },
    #[error("unknown shared object type `{0}`")]
    UnknownType(String),
}

impl ObjectError {
    pub fn mismatch(object: &ObjectId, reason: impl Into<String>) -> Self {
        ObjectError::StructuralMismatch {
            object: object.clone(),
            reason: reason.into(),
        }
    }
}

/// Contract every shared object type implements.
pub trait SharedObject: Send + Sync + fmt::Debug {
    fn id(&self) -> &ObjectId;

    /// Type tag this object was constructed from in the [`TypeRegistry`].
    fn type_name(&self) -> &'static str;

    /// Put a freshly created object into its initial state. Only called
    /// by the client that creates the document.
    fn initialize_first_time(&mut self);

    fn apply_mutation(&mut self, payload: &MutationPayload) -> Result<Applied, ObjectError>;

    fn create_snapshot(&self) -> ObjectSnapshot;

    fn load_snapshot(&mut self, content: SnapshotContent) -> Result<(), ObjectError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;
    use osucad_core::Vec2;

    #[test]
    fn test_payload_slots() {
        assert_eq!(MutationPayload::set("a", 1i64).slot(), Some("a"));
        assert_eq!(MutationPayload::MapClear.slot(), None);
        assert!(MutationPayload::MapClear.is_whole_object());

        let item = ObjectSnapshot::map(ObjectId::new("h1"), "hitObject", BTreeMap::new());
        assert_eq!(MutationPayload::ListInsert { item }.slot(), Some("h1"));
    }

    #[test]
    fn test_payload_normalization_rounds_insert_items() {
        let mut entries = BTreeMap::new();
        entries.insert("position".to_string(), Value::Vec2(Vec2::new(10.00049, 0.0)));
        let item = ObjectSnapshot::map(ObjectId::new("h1"), "hitObject", entries);

        match (MutationPayload::ListInsert { item }).normalized() {
            MutationPayload::ListInsert { item } => {
                assert_eq!(
                    item.entries().unwrap()["position"],
                    Value::Vec2(Vec2::new(10.0, 0.0))
                );
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(ObjectId::generate(), ObjectId::generate());
    }
}
