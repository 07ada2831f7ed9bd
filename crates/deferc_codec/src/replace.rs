use std::sync::Arc;

use ahash::AHashMap;
use deferc_ir::{HeapObject, ObjectRef};
use parking_lot::RwLock;

/// Rewrites heap references between their build-time and runtime forms.
///
/// The encoder stores the runtime form; the decoder hands back the build-time
/// form so passes run on the same objects they would have seen before encoding.
pub trait ObjectReplacer: Send + Sync {
    fn to_runtime(&self, object: &ObjectRef) -> ObjectRef;

    fn to_hosted(&self, object: &ObjectRef) -> ObjectRef;
}

/// Leaves every object untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityReplacer;

impl ObjectReplacer for IdentityReplacer {
    fn to_runtime(&self, object: &ObjectRef) -> ObjectRef {
        Arc::clone(object)
    }

    fn to_hosted(&self, object: &ObjectRef) -> ObjectRef {
        Arc::clone(object)
    }
}

#[derive(Default)]
struct ShadowMaps {
    // Both maps are keyed by the identity of the object being looked up.
    by_shadow: AHashMap<usize, ObjectRef>,
    by_runtime: AHashMap<usize, ObjectRef>,
}

/// Pairs of build-time shadow objects and the runtime objects they stand for.
#[derive(Default)]
pub struct ShadowHeap {
    maps: RwLock<ShadowMaps>,
}

impl ShadowHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shadow: ObjectRef, runtime: ObjectRef) {
        let mut maps = self.maps.write();
        maps.by_shadow
            .insert(HeapObject::identity(&shadow), Arc::clone(&runtime));
        maps.by_runtime.insert(HeapObject::identity(&runtime), shadow);
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_shadow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectReplacer for ShadowHeap {
    fn to_runtime(&self, object: &ObjectRef) -> ObjectRef {
        self.maps
            .read()
            .by_shadow
            .get(&HeapObject::identity(object))
            .map_or_else(|| Arc::clone(object), Arc::clone)
    }

    fn to_hosted(&self, object: &ObjectRef) -> ObjectRef {
        self.maps
            .read()
            .by_runtime
            .get(&HeapObject::identity(object))
            .map_or_else(|| Arc::clone(object), Arc::clone)
    }
}
