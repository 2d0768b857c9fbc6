//! Ordered collection of child map objects.
//!
//! Items are kept sorted by a numeric key read from the child (for example
//! `startTime` on hit objects). Ties are broken by object id so every
//! replica produces the same order. The list only stores `(sort value, id)`
//! pairs; the children themselves are separate shared objects registered
//! with the runtime.

use std::any::Any;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{
    Applied, ChangedProperty, MutationPayload, ObjectError, ObjectId, ObjectSnapshot,
    SharedObject, SnapshotContent,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: ObjectId,
    pub sort_value: f64,
}

impl ListItem {
    fn cmp_key(&self, sort_value: f64, id: &ObjectId) -> Ordering {
        self.sort_value
            .total_cmp(&sort_value)
            .then_with(|| self.id.cmp(id))
    }
}

#[derive(Debug, Clone)]
pub struct SharedSortedList {
    id: ObjectId,
    type_name: &'static str,
    sort_by: String,
    items: Vec<ListItem>,
}

impl SharedSortedList {
    pub fn new(id: ObjectId, type_name: &'static str, sort_by: impl Into<String>) -> Self {
        Self {
            id,
            type_name,
            sort_by: sort_by.into(),
            items: Vec::new(),
        }
    }

    /// Key read from each child to order the list.
    pub fn sort_by(&self) -> &str {
        &self.sort_by
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ObjectId> {
        self.items.get(index).map(|item| &item.id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.items.iter().map(|item| &item.id)
    }

    pub fn items(&self) -> &[ListItem] {
        &self.items
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn index_of(&self, id: &ObjectId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }

    fn insertion_point(&self, sort_value: f64, id: &ObjectId) -> usize {
        match self
            .items
            .binary_search_by(|item| item.cmp_key(sort_value, id))
        {
            Ok(index) | Err(index) => index,
        }
    }

    /// Move `id` to match a changed sort value. Returns `false` if the id
    /// is not in the list or its position did not change.
    pub fn reposition(&mut self, id: &ObjectId, sort_value: f64) -> bool {
        let Some(current) = self.index_of(id) else {
            return false;
        };
        let mut item = self.items.remove(current);
        let unchanged = item.sort_value.total_cmp(&sort_value) == Ordering::Equal;
        item.sort_value = sort_value;
        let target = self.insertion_point(sort_value, id);
        self.items.insert(target, item);
        !unchanged || target != current
    }

    fn sort_value_of(&self, item: &ObjectSnapshot) -> f64 {
        item.entries()
            .and_then(|entries| entries.get(&self.sort_by))
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0)
    }
}

impl SharedObject for SharedSortedList {
    fn id(&self) -> &ObjectId {
        &self.id
    }

    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn initialize_first_time(&mut self) {
        self.items.clear();
    }

    fn apply_mutation(&mut self, payload: &MutationPayload) -> Result<Applied, ObjectError> {
        match payload {
            MutationPayload::ListInsert { item } => {
                if item.entries().is_none() {
                    return Err(ObjectError::mismatch(
                        &self.id,
                        format!("item {} is not a map", item.id),
                    ));
                }
                if self.contains(&item.id) {
                    return Err(ObjectError::mismatch(
                        &self.id,
                        format!("item {} already present", item.id),
                    ));
                }

                let sort_value = self.sort_value_of(item);
                let index = self.insertion_point(sort_value, &item.id);
                self.items.insert(
                    index,
                    ListItem {
                        id: item.id.clone(),
                        sort_value,
                    },
                );

                Ok(Applied {
                    inverse: Some(MutationPayload::ListRemove {
                        id: item.id.clone(),
                    }),
                    changes: vec![ChangedProperty::ItemInserted(item.id.clone())],
                    attached: Some(item.clone()),
                    detached: None,
                })
            }
            MutationPayload::ListRemove { id } => {
                let index = self
                    .index_of(id)
                    .ok_or_else(|| ObjectError::mismatch(&self.id, format!("unknown item {id}")))?;
                self.items.remove(index);

                // The runtime fills in the inverse from the child's state.
                Ok(Applied {
                    inverse: None,
                    changes: vec![ChangedProperty::ItemRemoved(id.clone())],
                    attached: None,
                    detached: Some(id.clone()),
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
        ObjectSnapshot {
            id: self.id.clone(),
            type_name: self.type_name.to_string(),
            content: SnapshotContent::SortedList {
                sort_by: self.sort_by.clone(),
                items: self.items.clone(),
            },
        }
    }

    fn load_snapshot(&mut self, content: SnapshotContent) -> Result<(), ObjectError> {
        match content {
            SnapshotContent::SortedList { sort_by, mut items } => {
                items.sort_by(|a, b| a.cmp_key(b.sort_value, &b.id));
                self.sort_by = sort_by;
                self.items = items;
                Ok(())
            }
            SnapshotContent::Map { .. } => Err(ObjectError::mismatch(
                &self.id,
                "sorted list cannot load a map snapshot",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn list() -> SharedSortedList {
        SharedSortedList::new(ObjectId::new("list"), "sortedList", "time")
    }

    fn item(id: &str, time: f64) -> ObjectSnapshot {
        let mut entries = BTreeMap::new();
        entries.insert("time".to_string(), Value::Float(time));
        ObjectSnapshot::map(ObjectId::new(id), "map", entries)
    }

    fn insert(list: &mut SharedSortedList, id: &str, time: f64) -> Applied {
        list.apply_mutation(&MutationPayload::ListInsert { item: item(id, time) })
            .unwrap()
    }

    fn order(list: &SharedSortedList) -> Vec<&str> {
        list.ids().map(ObjectId::as_str).collect()
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut l = list();
        insert(&mut l, "c", 300.0);
        insert(&mut l, "a", 100.0);
        insert(&mut l, "b", 200.0);
        assert_eq!(order(&l), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_break_by_id() {
        let mut a = list();
        insert(&mut a, "y", 100.0);
        insert(&mut a, "x", 100.0);

        let mut b = list();
        insert(&mut b, "x", 100.0);
        insert(&mut b, "y", 100.0);

        assert_eq!(order(&a), order(&b));
    }

    #[test]
    fn test_insert_reports_child_and_inverse() {
        let mut l = list();
        let applied = insert(&mut l, "a", 1.0);
        assert_eq!(
            applied.inverse,
            Some(MutationPayload::ListRemove {
                id: ObjectId::new("a")
            })
        );
        assert_eq!(applied.attached.map(|s| s.id), Some(ObjectId::new("a")));
    }

    #[test]
    fn test_duplicate_insert_is_structural_mismatch() {
        let mut l = list();
        insert(&mut l, "a", 1.0);
        let err = l
            .apply_mutation(&MutationPayload::ListInsert { item: item("a", 5.0) })
            .unwrap_err();
        assert!(matches!(err, ObjectError::StructuralMismatch { .. }));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_structural_mismatch() {
        let mut l = list();
        let err = l
            .apply_mutation(&MutationPayload::ListRemove {
                id: ObjectId::new("ghost"),
            })
            .unwrap_err();
        assert!(matches!(err, ObjectError::StructuralMismatch { .. }));
    }

    #[test]
    fn test_remove_detaches_child() {
        let mut l = list();
        insert(&mut l, "a", 1.0);
        let applied = l
            .apply_mutation(&MutationPayload::ListRemove {
                id: ObjectId::new("a"),
            })
            .unwrap();
        assert_eq!(applied.detached, Some(ObjectId::new("a")));
        assert!(l.is_empty());
    }

    #[test]
    fn test_reposition() {
        let mut l = list();
        insert(&mut l, "a", 100.0);
        insert(&mut l, "b", 200.0);

        assert!(l.reposition(&ObjectId::new("a"), 300.0));
        assert_eq!(order(&l), vec!["b", "a"]);
        assert!(!l.reposition(&ObjectId::new("a"), 300.0));
        assert!(!l.reposition(&ObjectId::new("missing"), 0.0));
    }

    #[test]
    fn test_rejects_map_payloads() {
        let mut l = list();
        assert!(matches!(
            l.apply_mutation(&MutationPayload::MapClear),
            Err(ObjectError::TypeMismatch { .. })
        ));
    }
}
