//! Per-method variant bookkeeping.
//!
//! Every method owns at most one variant per [`VariantKind`]. Variants are
//! created on demand, never removed, and looked up by [`VariantId`] so that
//! other structures can refer to them without holding references.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use deferc_config::VariantKind;
use deferc_ir::Graph;
use deferc_symbol::MethodId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VariantId(pub u32);

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantKey {
    pub method: MethodId,
    pub kind: VariantKind,
}

/// Placement data filled in once code and data have been laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompiledMetadata {
    pub vtable_slot: Option<u32>,
    pub code_offset: Option<u32>,
    pub frame_info_offset: Option<u32>,
    /// Start of the variant's graph in the shared encoding.
    pub encoded_offset: Option<usize>,
}

#[derive(Debug, Clone)]
enum GraphSlot {
    Absent,
    Parsed(Arc<Graph>),
    Failed(String),
    /// The graph was encoded and dropped.
    Cleared,
}

/// One concrete variant of a method.
pub struct MethodVariant {
    pub id: VariantId,
    pub key: VariantKey,
    stub: AtomicBool,
    graph: Mutex<GraphSlot>,
    metadata: Mutex<CompiledMetadata>,
}

impl MethodVariant {
    fn new(id: VariantId, key: VariantKey, stub: bool) -> Self {
        Self {
            id,
            key,
            stub: AtomicBool::new(stub),
            graph: Mutex::new(GraphSlot::Absent),
            metadata: Mutex::new(CompiledMetadata::default()),
        }
    }

    #[inline]
    pub fn method(&self) -> MethodId {
        self.key.method
    }

    #[inline]
    pub fn kind(&self) -> VariantKind {
        self.key.kind
    }

    /// The variant exists for linking only and has no body yet.
    pub fn is_stub(&self) -> bool {
        self.stub.load(Ordering::Acquire)
    }

    pub fn graph(&self) -> Option<Arc<Graph>> {
        match &*self.graph.lock() {
            GraphSlot::Parsed(graph) => Some(Arc::clone(graph)),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<String> {
        match &*self.graph.lock() {
            GraphSlot::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn is_cleared(&self) -> bool {
        matches!(&*self.graph.lock(), GraphSlot::Cleared)
    }

    pub fn metadata(&self) -> CompiledMetadata {
        *self.metadata.lock()
    }
}

impl fmt::Debug for MethodVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodVariant")
            .field("id", &self.id)
            .field("method", &self.key.method)
            .field("kind", &self.key.kind)
            .field("stub", &self.is_stub())
            .finish()
    }
}

/// Result of [`VariantRegistry::get_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    pub id: VariantId,
    /// The variant did not exist before the call.
    pub new: bool,
}

/// Owner of every variant created during a build.
#[derive(Default)]
pub struct VariantRegistry {
    variants: RwLock<Vec<Arc<MethodVariant>>>,
    index: RwLock<AHashMap<VariantKey, VariantId>>,
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the `kind` variant of `method`, creating it if needed.
    ///
    /// A variant created with `eager == false` is a stub. Asking for an
    /// existing stub eagerly upgrades it. The Original variant is created
    /// first, as a stub, whenever another kind is requested for a method
    /// that has none yet.
    pub fn get_or_create(&self, method: MethodId, kind: VariantKind, eager: bool) -> Created {
        let key = VariantKey { method, kind };
        let mut index = self.index.write();
        if let Some(id) = index.get(&key).copied() {
            if eager {
                if let Some(variant) = self.get(id) {
                    if variant.stub.swap(false, Ordering::AcqRel) {
                        debug!(%method, %kind, "upgraded stub variant");
                    }
                }
            }
            return Created { id, new: false };
        }

        let mut variants = self.variants.write();
        if kind != VariantKind::Original {
            let original = VariantKey {
                method,
                kind: VariantKind::Original,
            };
            if !index.contains_key(&original) {
                let id = VariantId(variants.len() as u32);
                variants.push(Arc::new(MethodVariant::new(id, original, true)));
                index.insert(original, id);
            }
        }
        let id = VariantId(variants.len() as u32);
        variants.push(Arc::new(MethodVariant::new(id, key, !eager)));
        index.insert(key, id);
        debug!(%method, %kind, stub = !eager, "created variant");
        Created { id, new: true }
    }

    /// Create a variant that must not exist yet.
    pub fn register(&self, method: MethodId, kind: VariantKind) -> Result<VariantId, BuildError> {
        let created = self.get_or_create(method, kind, true);
        if created.new {
            Ok(created.id)
        } else {
            Err(BuildError::invariant(format!(
                "duplicate registration of the {kind} variant of {method}"
            )))
        }
    }

    pub fn lookup(&self, method: MethodId, kind: VariantKind) -> Option<VariantId> {
        self.index.read().get(&VariantKey { method, kind }).copied()
    }

    /// Like [`lookup`](Self::lookup), for variants that must already exist.
    pub fn require(&self, method: MethodId, kind: VariantKind) -> Result<VariantId, BuildError> {
        self.lookup(method, kind).ok_or_else(|| {
            BuildError::invariant(format!("missing {kind} variant of {method}"))
        })
    }

    pub fn get(&self, id: VariantId) -> Option<Arc<MethodVariant>> {
        self.variants.read().get(id.0 as usize).cloned()
    }

    fn variant(&self, id: VariantId) -> Result<Arc<MethodVariant>, BuildError> {
        self.get(id)
            .ok_or_else(|| BuildError::invariant(format!("unknown variant {id}")))
    }

    pub fn is_stub(&self, id: VariantId) -> bool {
        self.get(id).is_some_and(|variant| variant.is_stub())
    }

    /// Parse the variant's body exactly once.
    ///
    /// The first call runs `parse` and caches the outcome, success or failure;
    /// later calls return the cached result. Materializing a stub upgrades it.
    pub fn materialize<F>(&self, id: VariantId, parse: F) -> Result<Result<Arc<Graph>, String>, BuildError>
    where
        F: FnOnce(&MethodVariant) -> Result<Graph, String>,
    {
        let variant = self.variant(id)?;
        let mut slot = variant.graph.lock();
        let outcome = match &*slot {
            GraphSlot::Parsed(graph) => Ok(Arc::clone(graph)),
            GraphSlot::Failed(reason) => Err(reason.clone()),
            GraphSlot::Cleared => {
                return Err(BuildError::invariant(format!(
                    "graph of {} variant of {} requested after it was encoded",
                    variant.kind(),
                    variant.method()
                )));
            }
            GraphSlot::Absent => {
                variant.stub.store(false, Ordering::Release);
                match parse(&variant) {
                    Ok(graph) => {
                        let graph = Arc::new(graph);
                        *slot = GraphSlot::Parsed(Arc::clone(&graph));
                        Ok(graph)
                    }
                    Err(reason) => {
                        *slot = GraphSlot::Failed(reason.clone());
                        Err(reason)
                    }
                }
            }
        };
        Ok(outcome)
    }

    /// Mark a parsed variant as invalid after the fact.
    pub fn invalidate(&self, id: VariantId, reason: impl Into<String>) {
        if let Some(variant) = self.get(id) {
            *variant.graph.lock() = GraphSlot::Failed(reason.into());
        }
    }

    /// Rewrite a parsed graph in place.
    pub fn update_graph<R>(&self, id: VariantId, f: impl FnOnce(&mut Graph) -> R) -> Option<R> {
        let variant = self.get(id)?;
        let mut slot = variant.graph.lock();
        match &mut *slot {
            GraphSlot::Parsed(graph) => Some(f(Arc::make_mut(graph))),
            _ => None,
        }
    }

    /// Record where the backend placed the variant's code and frame data.
    pub fn record_placement(
        &self,
        id: VariantId,
        code_offset: u32,
        frame_info_offset: u32,
        vtable_slot: Option<u32>,
    ) -> Result<(), BuildError> {
        let variant = self.variant(id)?;
        let mut metadata = variant.metadata.lock();
        metadata.code_offset = Some(code_offset);
        metadata.frame_info_offset = Some(frame_info_offset);
        metadata.vtable_slot = vtable_slot;
        Ok(())
    }

    pub fn record_encoded_offset(&self, id: VariantId, offset: usize) -> Result<(), BuildError> {
        self.variant(id)?.metadata.lock().encoded_offset = Some(offset);
        Ok(())
    }

    /// Drop the graph once it has been encoded.
    pub fn clear_graph(&self, id: VariantId) {
        if let Some(variant) = self.get(id) {
            let mut slot = variant.graph.lock();
            if matches!(&*slot, GraphSlot::Parsed(_)) {
                *slot = GraphSlot::Cleared;
            }
        }
    }

    /// Check a call edge against the caller/callee matrix.
    pub fn check_call(&self, caller: VariantKind, callee: VariantKind) -> Result<(), BuildError> {
        if caller.may_call(callee) {
            Ok(())
        } else {
            Err(BuildError::invariant(format!(
                "a {caller} variant may not call a {callee} variant"
            )))
        }
    }

    /// Check a return edge against the caller/callee matrix.
    pub fn check_return(&self, caller: VariantKind, callee: VariantKind) -> Result<(), BuildError> {
        if caller.may_be_returned_into_from(callee) {
            Ok(())
        } else {
            Err(BuildError::invariant(format!(
                "a {callee} variant may not return into a {caller} variant"
            )))
        }
    }

    /// Variants of one kind ordered by method.
    pub fn variants_of_kind(&self, kind: VariantKind) -> Vec<Arc<MethodVariant>> {
        let mut variants: Vec<_> = self
            .variants
            .read()
            .iter()
            .filter(|variant| variant.kind() == kind)
            .cloned()
            .collect();
        variants.sort_by_key(|variant| variant.method());
        variants
    }

    pub fn len(&self) -> usize {
        self.variants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_is_created_first() {
        let registry = VariantRegistry::new();
        let deferred = registry.get_or_create(MethodId(4), VariantKind::Deferred, true);

        let original = registry.lookup(MethodId(4), VariantKind::Original).unwrap();
        assert!(original < deferred.id);
        assert!(registry.is_stub(original));
        assert!(!registry.is_stub(deferred.id));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn one_variant_per_method_and_kind() {
        let registry = VariantRegistry::new();
        let first = registry.get_or_create(MethodId(1), VariantKind::DeoptTarget, false);
        let second = registry.get_or_create(MethodId(1), VariantKind::DeoptTarget, false);

        assert!(first.new);
        assert!(!second.new);
        assert_eq!(first.id, second.id);
        assert!(registry.is_stub(first.id));

        registry.get_or_create(MethodId(1), VariantKind::DeoptTarget, true);
        assert!(!registry.is_stub(first.id));
    }

    #[test]
    fn concurrent_creation_yields_one_variant() {
        use rayon::prelude::*;

        let registry = VariantRegistry::new();
        let ids: Vec<VariantId> = (0..64)
            .into_par_iter()
            .map(|_| registry.get_or_create(MethodId(9), VariantKind::Deferred, false).id)
            .collect();

        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_is_an_invariant_violation() {
        let registry = VariantRegistry::new();
        registry.register(MethodId(2), VariantKind::Deferred).unwrap();
        let err = registry.register(MethodId(2), VariantKind::Deferred).unwrap_err();
        assert!(matches!(err, BuildError::InvariantViolation(_)));
        assert!(registry.require(MethodId(3), VariantKind::Deferred).is_err());
    }

    #[test]
    fn materialize_parses_exactly_once() {
        let registry = VariantRegistry::new();
        let id = registry.get_or_create(MethodId(0), VariantKind::Deferred, false).id;
        let mut calls = 0;

        let first = registry
            .materialize(id, |variant| {
                calls += 1;
                Ok(Graph::new(variant.method()))
            })
            .unwrap()
            .unwrap();
        let second = registry
            .materialize(id, |_| Err("must not run".to_string()))
            .unwrap()
            .unwrap();

        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!registry.is_stub(id));
    }

    #[test]
    fn failures_are_cached() {
        let registry = VariantRegistry::new();
        let id = registry.get_or_create(MethodId(0), VariantKind::Deferred, true).id;
        let outcome = registry.materialize(id, |_| Err("no body".to_string())).unwrap();
        assert_eq!(outcome.unwrap_err(), "no body");
        assert_eq!(registry.get(id).unwrap().failure().as_deref(), Some("no body"));
    }

    #[test]
    fn placement_and_clearing() {
        let registry = VariantRegistry::new();
        let id = registry.get_or_create(MethodId(0), VariantKind::Deferred, true).id;
        registry
            .materialize(id, |variant| Ok(Graph::new(variant.method())))
            .unwrap()
            .unwrap();
        registry.record_placement(id, 0x40, 0x80, Some(3)).unwrap();
        registry.record_encoded_offset(id, 12).unwrap();
        registry.clear_graph(id);

        let variant = registry.get(id).unwrap();
        assert!(variant.is_cleared());
        assert!(variant.graph().is_none());
        assert_eq!(
            variant.metadata(),
            CompiledMetadata {
                vtable_slot: Some(3),
                code_offset: Some(0x40),
                frame_info_offset: Some(0x80),
                encoded_offset: Some(12),
            }
        );
        assert!(registry.materialize(id, |_| Err(String::new())).is_err());
    }

    #[test]
    fn legality_checks() {
        let registry = VariantRegistry::new();
        assert!(registry.check_call(VariantKind::Deferred, VariantKind::DeoptTarget).is_ok());
        assert!(registry.check_call(VariantKind::DeoptTarget, VariantKind::Deferred).is_err());
        assert!(registry.check_return(VariantKind::Deferred, VariantKind::DeoptTarget).is_err());
        assert!(registry.check_return(VariantKind::DeoptTarget, VariantKind::Deferred).is_ok());
    }
}
