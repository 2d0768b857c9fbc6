//! Key/value shared object with last-writer-wins semantics per key.

use std::any::Any;
use std::collections::BTreeMap;

use super::{
    Applied, ChangedProperty, MutationPayload, ObjectError, ObjectId, ObjectSnapshot,
    SharedObject, SnapshotContent,
};
use crate::value::Value;

/// Produces the contents of a map created for a brand new document.
pub type MapInitializer = fn() -> BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct SharedMap {
    id: ObjectId,
    type_name: &'static str,
    entries: BTreeMap<String, Value>,
    initializer: Option<MapInitializer>,
}

impl SharedMap {
    pub fn new(id: ObjectId, type_name: &'static str) -> Self {
        Self {
            id,
            type_name,
            entries: BTreeMap::new(),
            initializer: None,
        }
    }

    pub fn with_initializer(mut self, initializer: MapInitializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    fn restore_inverse(key: &str, previous: Option<Value>) -> MutationPayload {
        match previous {
            Some(value) => MutationPayload::MapSet {
                key: key.to_string(),
                value,
            },
            None => MutationPayload::MapDelete {
                key: key.to_string(),
            },
        }
    }
}

impl SharedObject for SharedMap {
    fn id(&self) -> &ObjectId {
        &self.id
    }

    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn initialize_first_time(&mut self) {
        self.entries = self.initializer.map(|init| init()).unwrap_or_default();
    }

    fn apply_mutation(&mut self, payload: &MutationPayload) -> Result<Applied, ObjectError> {
        match payload {
            MutationPayload::MapSet { key, value } => {
                let previous = self.entries.insert(key.clone(), value.clone());
                Ok(Applied {
                    inverse: Some(Self::restore_inverse(key, previous)),
                    changes: vec![ChangedProperty::Key(key.clone())],
                    ..Applied::default()
                })
            }
            MutationPayload::MapDelete { key } => match self.entries.remove(key) {
                Some(previous) => Ok(Applied {
                    inverse: Some(Self::restore_inverse(key, Some(previous))),
                    changes: vec![ChangedProperty::Key(key.clone())],
                    ..Applied::default()
                }),
                None => Ok(Applied::default()),
            },
            MutationPayload::MapClear => {
                let previous = std::mem::take(&mut self.entries);
                Ok(Applied {
                    inverse: Some(MutationPayload::MapReplace { entries: previous }),
                    changes: vec![ChangedProperty::Cleared],
                    ..Applied::default()
                })
            }
            MutationPayload::MapReplace { entries } => {
                let previous = std::mem::replace(&mut self.entries, entries.clone());
                Ok(Applied {
                    inverse: Some(MutationPayload::MapReplace { entries: previous }),
                    changes: vec![ChangedProperty::Cleared],
                    ..Applied::default()
                })
            }
            other => Err(ObjectError::TypeMismatch {
                object: self.id.clone(),
                type_name: self.type_name,
                payload: other.kind(),
            }),
        }
    }

    fn create_snapshot(&self) -> ObjectSnapshot {
        ObjectSnapshot::map(self.id.clone(), self.type_name, self.entries.clone())
    }

    fn load_snapshot(&mut self, content: SnapshotContent) -> Result<(), ObjectError> {
        match content {
            SnapshotContent::Map { entries } => {
                self.entries = entries;
                Ok(())
            }
            SnapshotContent::SortedList { .. } => Err(ObjectError::mismatch(
                &self.id,
                "map cannot load a sorted list snapshot",
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
