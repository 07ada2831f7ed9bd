use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::symbol::Symbol;

/// Dense index of a [`Method`] inside its [`MethodTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

impl MethodId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Properties of a method that the build consults but never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFlags {
    /// The method has a body the front end can parse.
    pub has_body: bool,
    /// Annotated as must-not-inline.
    pub never_inline: bool,
    /// The method may receive a Deferred variant.
    pub allow_deferred: bool,
}

impl Default for MethodFlags {
    fn default() -> Self {
        Self {
            has_body: true,
            never_inline: false,
            allow_deferred: true,
        }
    }
}

/// Stable identity of a declared procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub id: MethodId,
    pub owner: Symbol,
    pub name: Symbol,
    pub signature: Symbol,
    pub flags: MethodFlags,
}

impl Method {
    /// `Owner.name` using the short owner name.
    pub fn short_name(&self) -> String {
        format!("{}.{}", self.owner.short(), self.name)
    }

    /// `pkg.Owner.name(signature)`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}({})", self.owner, self.name, self.signature)
    }

    /// `pkg.Owner.name`, the key used by program descriptions.
    pub fn lookup_key(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

type MethodKey = (Symbol, Symbol, Symbol);

/// The whole-program method universe.
///
/// Methods are interned: declaring the same (owner, name, signature) twice
/// yields the same [`MethodId`].
#[derive(Default)]
pub struct MethodTable {
    methods: RwLock<Vec<Arc<Method>>>,
    by_key: RwLock<AHashMap<MethodKey, MethodId>>,
    by_name: RwLock<AHashMap<String, MethodId>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(
        &self,
        owner: impl Into<Symbol>,
        name: impl Into<Symbol>,
        signature: impl Into<Symbol>,
        flags: MethodFlags,
    ) -> MethodId {
        let key = (owner.into(), name.into(), signature.into());
        let mut by_key = self.by_key.write();
        if let Some(id) = by_key.get(&key) {
            return *id;
        }

        let mut methods = self.methods.write();
        let id = MethodId(methods.len() as u32);
        let method = Method {
            id,
            owner: key.0.clone(),
            name: key.1.clone(),
            signature: key.2.clone(),
            flags,
        };
        self.by_name
            .write()
            .entry(method.lookup_key())
            .or_insert(id);
        methods.push(Arc::new(method));
        by_key.insert(key, id);
        id
    }

    pub fn get(&self, id: MethodId) -> Option<Arc<Method>> {
        self.methods.read().get(id.index()).cloned()
    }

    /// Resolve `pkg.Owner.name`. The first declaration wins for overloads.
    pub fn resolve(&self, name: &str) -> Option<MethodId> {
        self.by_name.read().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Method>> {
        self.methods.read().clone()
    }

    /// Qualified name for diagnostics; unknown ids render as their raw index.
    pub fn describe(&self, id: MethodId) -> String {
        self.get(id)
            .map(|m| m.qualified_name())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn short_name(&self, id: MethodId) -> String {
        self.get(id)
            .map(|m| m.short_name())
            .unwrap_or_else(|| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_interns_identical_methods() {
        let table = MethodTable::new();
        let a = table.declare("app.A", "f", "()V", MethodFlags::default());
        let b = table.declare("app.A", "f", "()V", MethodFlags::default());
        let c = table.declare("app.B", "f", "()V", MethodFlags::default());

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("app.B.f"), Some(c));
    }

    #[test]
    fn names_render_for_diagnostics() {
        let table = MethodTable::new();
        let id = table.declare("app.Main", "main", "[String]V", MethodFlags::default());

        assert_eq!(table.short_name(id), "Main.main");
        assert_eq!(table.describe(id), "app.Main.main([String]V)");
        assert_eq!(table.describe(MethodId(99)), "m99");
    }
}
