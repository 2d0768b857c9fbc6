//! Type registry: a closed table from type tag to constructor.
//!
//! A registry is built once and handed to each
//! [`DocumentRuntime`](crate::runtime::DocumentRuntime), so documents and
//! tests never share registration state.

use std::collections::HashMap;

use super::{ObjectError, ObjectId, SharedMap, SharedObject, SharedSortedList};

pub type Constructor = fn(ObjectId) -> Box<dyn SharedObject>;

pub const MAP_TYPE: &str = "map";
pub const SORTED_LIST_TYPE: &str = "sortedList";

#[derive(Clone)]
pub struct TypeRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.constructors.keys().collect();
        tags.sort();
        f.debug_struct("TypeRegistry").field("types", &tags).finish()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtin_types()
    }
}

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the generic `map` and `sortedList` types.
    pub fn with_builtin_types() -> Self {
        Self::new()
            .with(MAP_TYPE, |id| Box::new(SharedMap::new(id, MAP_TYPE)))
            .with(SORTED_LIST_TYPE, |id| {
                Box::new(SharedSortedList::new(id, SORTED_LIST_TYPE, "sortKey"))
            })
    }

    /// Register `tag`, replacing any previous constructor.
    pub fn with(mut self, tag: &'static str, constructor: Constructor) -> Self {
        self.constructors.insert(tag, constructor);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    pub fn create(&self, tag: &str, id: ObjectId) -> Result<Box<dyn SharedObject>, ObjectError> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| ObjectError::UnknownType(tag.to_string()))?;
        Ok(constructor(id))
    }
}
