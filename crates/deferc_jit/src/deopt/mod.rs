//! Deoptimization re-entry bookkeeping.

pub mod cleanup;
pub mod collector;

pub use cleanup::{CleanupAction, CleanupSummary, check_exposed, cleanup_deopt_target};
pub use collector::{collect_entries, prune_unreachable_call};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use deferc_ir::FrameStateData;
use deferc_symbol::MethodId;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::BuildError;

/// A program point the DeoptTarget variant of a method must be able to resume at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeoptEntryKey {
    pub bci: i32,
    pub during_call: bool,
    pub rethrow: bool,
}

impl From<&FrameStateData> for DeoptEntryKey {
    fn from(state: &FrameStateData) -> Self {
        Self {
            bci: state.bci,
            during_call: state.during_call,
            rethrow: state.rethrow,
        }
    }
}

/// Add-only set of deopt entries, sealed before DeoptTarget graphs are finished.
#[derive(Debug, Default)]
pub struct DeoptEntries {
    entries: RwLock<BTreeMap<MethodId, BTreeSet<DeoptEntryKey>>>,
    sealed: AtomicBool,
}

impl DeoptEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the entry was not registered before.
    pub fn register(&self, method: MethodId, key: DeoptEntryKey) -> Result<bool, BuildError> {
        let mut entries = self.entries.write();
        if entries.get(&method).is_some_and(|keys| keys.contains(&key)) {
            return Ok(false);
        }
        if self.is_sealed() {
            return Err(BuildError::invariant(format!(
                "deopt entry {method}@{} registered after sealing",
                key.bci
            )));
        }
        entries.entry(method).or_default().insert(key);
        Ok(true)
    }

    pub fn contains(&self, method: MethodId, key: &DeoptEntryKey) -> bool {
        self.entries
            .read()
            .get(&method)
            .is_some_and(|keys| keys.contains(key))
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Methods with at least one entry, in id order.
    pub fn methods(&self) -> Vec<MethodId> {
        self.entries.read().keys().copied().collect()
    }

    pub fn entries_of(&self, method: MethodId) -> Vec<DeoptEntryKey> {
        self.entries
            .read()
            .get(&method)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
