use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use deferc_ir::{HeapObject, ObjectRef};
use deferc_symbol::MethodId;

use crate::error::CodecError;

/// A value referenced from an encoded graph through the object table.
#[derive(Debug, Clone)]
pub enum TableObject {
    Object(ObjectRef),
    Method(MethodId),
}

impl TableObject {
    fn key(&self) -> TableKey {
        match self {
            TableObject::Object(object) => TableKey::Object(HeapObject::identity(object)),
            TableObject::Method(method) => TableKey::Method(*method),
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            TableObject::Object(object) => Some(object),
            TableObject::Method(_) => None,
        }
    }

    pub fn as_method(&self) -> Option<MethodId> {
        match self {
            TableObject::Method(method) => Some(*method),
            TableObject::Object(_) => None,
        }
    }
}

impl fmt::Display for TableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableObject::Object(object) => write!(f, "object {object}"),
            TableObject::Method(method) => write!(f, "method {method}"),
        }
    }
}

impl PartialEq for TableObject {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TableObject {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TableKey {
    Object(usize),
    Method(MethodId),
}

/// Deduplicated, insertion-ordered side table of graph references.
///
/// Objects are keyed by identity: two equal strings living at different
/// addresses get two ids. The table keeps every object alive, so an identity
/// stays unique for as long as the table exists.
#[derive(Debug, Default, Clone)]
pub struct ObjectTable {
    entries: Vec<TableObject>,
    index: AHashMap<TableKey, u32>,
    frozen: bool,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a frozen table from previously emitted entries.
    pub fn from_entries(entries: Vec<TableObject>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(id, entry)| (entry.key(), id as u32))
            .collect();
        Self {
            entries,
            index,
            frozen: true,
        }
    }

    /// Return the id of `object`, assigning the next id on first sight.
    pub fn add(&mut self, object: TableObject) -> Result<u32, CodecError> {
        let key = object.key();
        if let Some(id) = self.index.get(&key) {
            return Ok(*id);
        }
        if self.frozen {
            return Err(CodecError::TableFrozen);
        }
        let id = self.entries.len() as u32;
        self.entries.push(object);
        self.index.insert(key, id);
        Ok(id)
    }

    pub fn id_of(&self, object: &TableObject) -> Result<u32, CodecError> {
        self.index
            .get(&object.key())
            .copied()
            .ok_or_else(|| CodecError::MissingObject(object.to_string()))
    }

    pub fn get(&self, id: u32) -> Result<&TableObject, CodecError> {
        self.entries
            .get(id as usize)
            .ok_or(CodecError::BadObjectId(id))
    }

    pub fn object(&self, id: u32) -> Result<ObjectRef, CodecError> {
        self.get(id)?
            .as_object()
            .map(Arc::clone)
            .ok_or(CodecError::WrongObjectKind {
                id,
                expected: "heap object",
            })
    }

    pub fn method(&self, id: u32) -> Result<MethodId, CodecError> {
        self.get(id)?.as_method().ok_or(CodecError::WrongObjectKind {
            id,
            expected: "method",
        })
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TableObject] {
        &self.entries
    }

    /// Number of heap objects, method references excluded.
    pub fn object_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.as_object().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_assigned_by_identity() {
        let mut table = ObjectTable::new();
        let literal = HeapObject::string("literal");
        let twin = HeapObject::string("literal");

        let a = table.add(TableObject::Object(Arc::clone(&literal))).unwrap();
        let b = table.add(TableObject::Object(literal)).unwrap();
        let c = table.add(TableObject::Object(twin)).unwrap();
        let m = table.add(TableObject::Method(MethodId(3))).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(m, 2);
        assert_eq!(table.object_count(), 2);
        assert_eq!(table.method(m), Ok(MethodId(3)));
        assert!(table.object(m).is_err());
    }

    #[test]
    fn frozen_table_accepts_only_known_objects() {
        let mut table = ObjectTable::new();
        let known = HeapObject::string("known");
        table.add(TableObject::Object(Arc::clone(&known))).unwrap();
        table.freeze();

        assert_eq!(table.add(TableObject::Object(known)), Ok(0));
        assert_eq!(
            table.add(TableObject::Object(HeapObject::string("late"))),
            Err(CodecError::TableFrozen)
        );
    }
}
