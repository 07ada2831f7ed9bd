use std::fmt;
use std::sync::Arc;

/// Payload of a heap-resident constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeapValue {
    Str(String),
    Bytes(Vec<u8>),
    /// A reference to a type, by name.
    Type(String),
}

/// A heap-resident value referenced from a graph.
///
/// Identity matters: two objects with equal contents are still distinct
/// values, mirroring distinct objects in the image heap.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct HeapObject {
    pub value: HeapValue,
}

pub type ObjectRef = Arc<HeapObject>;

impl HeapObject {
    pub fn new(value: HeapValue) -> ObjectRef {
        Arc::new(Self { value })
    }

    pub fn string(text: impl Into<String>) -> ObjectRef {
        Self::new(HeapValue::Str(text.into()))
    }

    /// Address-based identity of an object reference.
    #[inline]
    pub fn identity(object: &ObjectRef) -> usize {
        Arc::as_ptr(object) as usize
    }
}

impl fmt::Display for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            HeapValue::Str(text) => write!(f, "{text:?}"),
            HeapValue::Bytes(bytes) => write!(f, "bytes[{}]", bytes.len()),
            HeapValue::Type(name) => write!(f, "type {name}"),
        }
    }
}
