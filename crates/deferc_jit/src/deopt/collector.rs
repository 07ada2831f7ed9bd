//! Registration of deopt entries and pruning of unreachable call sites.

use deferc_ir::{DeoptReason, Graph, Node, NodeId, NodeKind};
use tracing::debug;

use super::{DeoptEntries, DeoptEntryKey};
use crate::error::BuildError;

/// Register every re-entry point a finalized Deferred graph may deoptimize to.
///
/// Each frame state contributes itself and all enclosing inlined-caller
/// states with a non-negative bci. The state of the start node is skipped for
/// non-root variants since it disappears once the method is inlined.
/// Every invoke with an exception edge also needs an entry at its own bci
/// while the call is still on the stack.
///
/// Returns the number of newly registered entries.
pub fn collect_entries(
    graph: &Graph,
    is_root: bool,
    entries: &DeoptEntries,
) -> Result<usize, BuildError> {
    let start_state = graph.node(graph.start()).and_then(|start| start.state);
    let mut added = 0;

    for state in graph.frame_states() {
        if !is_root && Some(state) == start_state && graph.usages(state).len() == 1 {
            continue;
        }
        for frame in graph.frame_state_chain(state) {
            let Some(data) = graph.kind(frame).and_then(NodeKind::frame_state) else {
                continue;
            };
            if data.bci < 0 {
                continue;
            }
            if entries.register(data.method, DeoptEntryKey::from(data))? {
                added += 1;
            }
        }
    }

    for (_, node) in graph.iter() {
        let NodeKind::InvokeWithException(invoke) = &node.kind else {
            continue;
        };
        let method = node
            .state
            .and_then(|state| graph.kind(state))
            .and_then(NodeKind::frame_state)
            .map_or(graph.method(), |state| state.method);
        let key = DeoptEntryKey {
            bci: invoke.bci,
            during_call: true,
            rethrow: false,
        };
        if entries.register(method, key)? {
            added += 1;
        }
    }

    debug!(method = %graph.method(), added, "collected deopt entries");
    Ok(added)
}

/// Replace a call site without reachable callees by an unconditional guard.
///
/// A receiver null check is kept in front of the guard so that a legitimate
/// null-pointer fault still happens. Everything only reachable through the
/// call is removed.
pub fn prune_unreachable_call(graph: &mut Graph, invoke: NodeId) -> Result<(), BuildError> {
    let node = graph
        .node(invoke)
        .ok_or_else(|| BuildError::invariant(format!("pruned call {invoke} is not in the graph")))?;
    let Some(data) = node.kind.invoke().copied() else {
        return Err(BuildError::invariant(format!(
            "pruned node {invoke} is a {}, not a call",
            node.kind.name()
        )));
    };
    let state = node.state;
    let receiver = if data.has_receiver {
        node.inputs.first().copied()
    } else {
        None
    };

    if let Some(receiver) = receiver {
        let is_null = graph.add(Node::new(NodeKind::IsNull).with_inputs(vec![receiver]));
        let mut null_check = Node::new(NodeKind::FixedGuard {
            reason: DeoptReason::NullCheckException,
            negated: false,
        })
        .with_inputs(vec![is_null]);
        null_check.state = state;
        graph.insert_before(invoke, null_check);
    }

    let mut guard = Node::new(NodeKind::FixedGuard {
        reason: DeoptReason::UnreachedCode,
        negated: false,
    });
    guard.state = state;
    let guard = graph.insert_before(invoke, guard);
    if let Some(guard) = graph.node_mut(guard) {
        guard.successors.clear();
    }

    graph.remove(invoke);
    let removed = graph.remove_dead_code();
    debug!(method = %graph.method(), bci = data.bci, removed, "pruned unreachable call");
    Ok(())
}
