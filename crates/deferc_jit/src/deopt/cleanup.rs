//! Post-seal cleanup of DeoptTarget graphs.
//!
//! A DeoptTarget graph is parsed with a re-entry node at every point that
//! could in principle be resumed. Once the entry set is sealed, every such
//! node is classified against it.

use ahash::{AHashMap, AHashSet};
use deferc_ir::{Graph, NodeId, NodeKind};
use tracing::debug;

use super::{DeoptEntries, DeoptEntryKey};
use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    /// The point is a registered entry.
    Keep,
    /// Not an entry, but it sits on a call boundary that must stay intact;
    /// replaced by a lighter anchor.
    Proxify,
    Remove,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub kept: usize,
    pub proxified: usize,
    pub removed: usize,
}

fn classify(graph: &Graph, state: Option<NodeId>, entries: &DeoptEntries) -> CleanupAction {
    let Some(data) = state
        .and_then(|state| graph.kind(state))
        .and_then(NodeKind::frame_state)
    else {
        return CleanupAction::Remove;
    };
    if entries.contains(data.method, &DeoptEntryKey::from(data)) {
        CleanupAction::Keep
    } else if data.during_call {
        CleanupAction::Proxify
    } else {
        CleanupAction::Remove
    }
}

pub fn cleanup_deopt_target(graph: &mut Graph, entries: &DeoptEntries) -> CleanupSummary {
    let mut decisions: AHashMap<Option<NodeId>, CleanupAction> = AHashMap::new();
    let mut summary = CleanupSummary::default();

    let candidates: Vec<(NodeId, Option<NodeId>)> = graph
        .iter()
        .filter(|(_, node)| matches!(node.kind, NodeKind::DeoptEntry))
        .map(|(id, node)| (id, node.state))
        .collect();

    for (id, state) in candidates {
        let action = *decisions
            .entry(state)
            .or_insert_with(|| classify(graph, state, entries));
        match action {
            CleanupAction::Keep => summary.kept += 1,
            CleanupAction::Proxify => {
                if let Some(node) = graph.node_mut(id) {
                    node.kind = NodeKind::DeoptProxyAnchor;
                }
                summary.proxified += 1;
            }
            CleanupAction::Remove => {
                graph.remove_fixed(id);
                summary.removed += 1;
            }
        }
    }

    graph.remove_dead_code();
    debug!(
        method = %graph.method(),
        kept = summary.kept,
        proxified = summary.proxified,
        removed = summary.removed,
        "cleaned up deopt target"
    );
    summary
}

/// Fails unless every sealed entry of the graph's method is a kept `DeoptEntry`.
pub fn check_exposed(graph: &Graph, entries: &DeoptEntries) -> Result<(), BuildError> {
    let method = graph.method();
    let exposed: AHashSet<DeoptEntryKey> = graph
        .iter()
        .filter(|(_, node)| matches!(node.kind, NodeKind::DeoptEntry))
        .filter_map(|(_, node)| node.state.and_then(|state| graph.kind(state)))
        .filter_map(NodeKind::frame_state)
        .filter(|data| data.method == method)
        .map(DeoptEntryKey::from)
        .collect();

    match entries
        .entries_of(method)
        .into_iter()
        .find(|key| !exposed.contains(key))
    {
        Some(key) => Err(BuildError::invariant(format!(
            "deopt entry {method}@{} (during_call={}, rethrow={}) has no re-entry point",
            key.bci, key.during_call, key.rethrow
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deferc_ir::{FrameStateData, Node};
    use deferc_symbol::MethodId;

    const METHOD: MethodId = MethodId(3);

    fn entry_at(graph: &mut Graph, after: NodeId, bci: i32, during_call: bool) -> (NodeId, NodeId) {
        frame_entry_at(graph, after, bci, during_call, false)
    }

    fn frame_entry_at(
        graph: &mut Graph,
        after: NodeId,
        bci: i32,
        during_call: bool,
        rethrow: bool,
    ) -> (NodeId, NodeId) {
        let state = graph.add(Node::new(NodeKind::FrameState(FrameStateData {
            method: METHOD,
            bci,
            during_call,
            rethrow,
        })));
        let entry = graph.insert_after(after, Node::new(NodeKind::DeoptEntry).with_state(state));
        (entry, state)
    }

    #[test]
    fn entries_are_kept_proxified_or_removed() {
        let mut graph = Graph::new(METHOD);
        let graph_start = graph.start();
        let (registered, _) = entry_at(&mut graph, graph_start, 0, false);
        let (boundary, _) = entry_at(&mut graph, registered, 4, true);
        let (stale, stale_state) = entry_at(&mut graph, boundary, 6, false);
        let ret = graph.insert_after(stale, Node::new(NodeKind::Return));

        let entries = DeoptEntries::new();
        entries
            .register(
                METHOD,
                DeoptEntryKey {
                    bci: 0,
                    during_call: false,
                    rethrow: false,
                },
            )
            .unwrap();
        entries.seal();

        let summary = cleanup_deopt_target(&mut graph, &entries);

        assert_eq!(
            summary,
            CleanupSummary {
                kept: 1,
                proxified: 1,
                removed: 1
            }
        );
        assert_eq!(graph.kind(registered), Some(&NodeKind::DeoptEntry));
        assert_eq!(graph.kind(boundary), Some(&NodeKind::DeoptProxyAnchor));
        assert!(!graph.contains(stale));
        assert!(!graph.contains(stale_state));
        assert_eq!(graph.node(boundary).unwrap().next(), Some(ret));
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn shared_states_are_classified_once() {
        let mut graph = Graph::new(METHOD);
        let graph_start = graph.start();
        let (first, state) = entry_at(&mut graph, graph_start, 2, true);
        let second = graph.insert_after(first, Node::new(NodeKind::DeoptEntry).with_state(state));

        let summary = cleanup_deopt_target(&mut graph, &DeoptEntries::new());

        assert_eq!(summary.proxified, 2);
        assert_eq!(graph.kind(second), Some(&NodeKind::DeoptProxyAnchor));
    }

    #[test]
    fn sealed_entries_without_a_node_are_rejected() {
        let mut graph = Graph::new(METHOD);
        let graph_start = graph.start();
        let (start, _) = entry_at(&mut graph, graph_start, 0, false);
        graph.insert_after(start, Node::new(NodeKind::Return));

        let entries = DeoptEntries::new();
        let rethrow = DeoptEntryKey {
            bci: 2,
            during_call: false,
            rethrow: true,
        };
        let start_key = DeoptEntryKey {
            bci: 0,
            during_call: false,
            rethrow: false,
        };
        entries.register(METHOD, start_key).unwrap();
        entries.register(METHOD, rethrow).unwrap();
        entries.seal();
        cleanup_deopt_target(&mut graph, &entries);

        let err = check_exposed(&graph, &entries).unwrap_err();
        assert!(matches!(err, BuildError::InvariantViolation(_)));

        // the same point after a rethrow node exists
        let mut graph = Graph::new(METHOD);
        let graph_start = graph.start();
        let (start, _) = entry_at(&mut graph, graph_start, 0, false);
        let (exposed, _) = frame_entry_at(&mut graph, start, 2, false, true);
        graph.insert_after(exposed, Node::new(NodeKind::Return));
        cleanup_deopt_target(&mut graph, &entries);

        assert!(check_exposed(&graph, &entries).is_ok());
    }
}
