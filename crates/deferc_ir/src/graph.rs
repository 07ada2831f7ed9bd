use ahash::AHashSet;
use deferc_symbol::MethodId;

use crate::node::{Node, NodeId, NodeKind};

/// A directed graph of operation nodes owned by one method variant.
///
/// Removed nodes leave a hole in the arena so that ids stay stable while a
/// pass rewrites the graph.
#[derive(Debug, Clone)]
pub struct Graph {
    method: MethodId,
    nodes: Vec<Option<Node>>,
    start: NodeId,
    inlined_methods: Vec<MethodId>,
}

impl Graph {
    pub fn new(method: MethodId) -> Self {
        Self {
            method,
            nodes: vec![Some(Node::new(NodeKind::Start))],
            start: NodeId(0),
            inlined_methods: Vec::new(),
        }
    }

    /// Rebuild a graph from a dense node list; the first node must be the start.
    pub fn from_nodes(method: MethodId, nodes: Vec<Node>, inlined_methods: Vec<MethodId>) -> Self {
        Self {
            method,
            nodes: nodes.into_iter().map(Some).collect(),
            start: NodeId(0),
            inlined_methods,
        }
    }

    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    #[inline]
    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.node(id).map(|node| &node.kind)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Live nodes in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, node)| node.as_ref().map(|node| (NodeId(idx as u32), node)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    pub fn inlined_methods(&self) -> &[MethodId] {
        &self.inlined_methods
    }

    pub fn record_inlined(&mut self, method: MethodId) {
        if !self.inlined_methods.contains(&method) {
            self.inlined_methods.push(method);
        }
    }

    /// Link `from` to `to` as its primary control successor.
    pub fn set_next(&mut self, from: NodeId, to: NodeId) {
        if let Some(node) = self.node_mut(from) {
            if node.successors.is_empty() {
                node.successors.push(to);
            } else {
                node.successors[0] = to;
            }
        }
    }

    /// Insert a fixed node between `after` and its primary successor.
    pub fn insert_after(&mut self, after: NodeId, mut node: Node) -> NodeId {
        let next = self.node(after).and_then(Node::next);
        node.successors = next.into_iter().collect();
        let id = self.add(node);
        self.set_next(after, id);
        id
    }

    /// Insert a fixed node between `before` and its control predecessor.
    pub fn insert_before(&mut self, before: NodeId, mut node: Node) -> NodeId {
        node.successors = vec![before];
        let id = self.add(node);
        if let Some(pred) = self.predecessor(before) {
            self.replace_successor(pred, before, id);
        }
        id
    }

    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        self.iter()
            .find(|(_, node)| node.successors.contains(&id))
            .map(|(pred, _)| pred)
    }

    /// Nodes that reference `id` through an input or state edge.
    pub fn usages(&self, id: NodeId) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.inputs.contains(&id) || node.state == Some(id))
            .map(|(user, _)| user)
            .collect()
    }

    pub fn replace_at_usages(&mut self, old: NodeId, new: NodeId) {
        for node in self.nodes.iter_mut().flatten() {
            for input in node.inputs.iter_mut() {
                if *input == old {
                    *input = new;
                }
            }
            if node.state == Some(old) {
                node.state = Some(new);
            }
        }
    }

    pub fn replace_successor(&mut self, pred: NodeId, old: NodeId, new: NodeId) {
        if let Some(node) = self.node_mut(pred) {
            for succ in node.successors.iter_mut() {
                if *succ == old {
                    *succ = new;
                }
            }
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        if id == self.start {
            return None;
        }
        self.nodes.get_mut(id.index()).and_then(Option::take)
    }

    /// Unlink a fixed node from the control chain, connecting its predecessor
    /// to its primary successor, and delete it.
    pub fn remove_fixed(&mut self, id: NodeId) -> Option<Node> {
        let next = self.node(id).and_then(Node::next);
        if let Some(pred) = self.predecessor(id) {
            match next {
                Some(next) => self.replace_successor(pred, id, next),
                None => {
                    if let Some(node) = self.node_mut(pred) {
                        node.successors.retain(|succ| *succ != id);
                    }
                }
            }
        }
        self.remove(id)
    }

    /// Delete every node no longer reachable from the start node.
    ///
    /// Returns the number of nodes removed.
    pub fn remove_dead_code(&mut self) -> usize {
        let mut live = AHashSet::new();
        let mut worklist = vec![self.start];
        while let Some(id) = worklist.pop() {
            if !live.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                worklist.extend(node.successors.iter().copied());
                worklist.extend(node.inputs.iter().copied());
                worklist.extend(node.state);
            }
        }

        let mut removed = 0;
        for (idx, slot) in self.nodes.iter_mut().enumerate() {
            if slot.is_some() && !live.contains(&NodeId(idx as u32)) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Call sites ordered by program point, ties broken by node id.
    pub fn invokes(&self) -> Vec<NodeId> {
        let mut invokes: Vec<(i32, NodeId)> = self
            .iter()
            .filter_map(|(id, node)| node.kind.invoke().map(|data| (data.bci, id)))
            .collect();
        invokes.sort();
        invokes.into_iter().map(|(_, id)| id).collect()
    }

    pub fn frame_states(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| matches!(node.kind, NodeKind::FrameState(_)))
            .map(|(id, _)| id)
            .collect()
    }

    /// `state` followed by its enclosing (inlined caller) states, innermost first.
    pub fn frame_state_chain(&self, state: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = Some(state);
        while let Some(id) = current {
            if chain.contains(&id) {
                break;
            }
            match self.node(id) {
                Some(node) if matches!(node.kind, NodeKind::FrameState(_)) => {
                    chain.push(id);
                    current = node.state;
                }
                _ => break,
            }
        }
        chain
    }

    /// Number of inlined frames enclosing `state`.
    pub fn inlining_depth(&self, state: NodeId) -> usize {
        self.frame_state_chain(state).len().saturating_sub(1)
    }

    /// Check that every edge points at a live node.
    pub fn verify(&self) -> Result<(), String> {
        for (id, node) in self.iter() {
            let edges = node
                .inputs
                .iter()
                .chain(node.successors.iter())
                .chain(node.state.iter());
            for edge in edges {
                if !self.contains(*edge) {
                    return Err(format!(
                        "{} {id} references removed node {edge}",
                        node.kind.name()
                    ));
                }
            }
            if matches!(node.kind, NodeKind::FrameState(_))
                && node.state.is_some_and(|outer| {
                    !matches!(self.kind(outer), Some(NodeKind::FrameState(_)))
                })
            {
                return Err(format!("frame state {id} has a non-frame-state outer"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CallKind, Constant, FrameStateData, InvokeData};

    fn state(graph: &mut Graph, bci: i32, outer: Option<NodeId>) -> NodeId {
        let mut node = Node::new(NodeKind::FrameState(FrameStateData {
            method: graph.method(),
            bci,
            during_call: false,
            rethrow: false,
        }));
        node.state = outer;
        graph.add(node)
    }

    fn invoke(graph: &mut Graph, after: NodeId, bci: i32) -> NodeId {
        let target = MethodId(7);
        let after_state = state(graph, bci, None);
        let node = Node::new(NodeKind::Invoke(InvokeData {
            target,
            declared: target,
            kind: CallKind::Static,
            bci,
            has_receiver: false,
        }))
        .with_state(after_state);
        graph.insert_after(after, node)
    }

    #[test]
    fn invokes_are_ordered_by_program_point() {
        let mut graph = Graph::new(MethodId(0));
        let graph_start = graph.start();
        let late = invoke(&mut graph, graph_start, 9);
        let early = invoke(&mut graph, late, 2);

        assert_eq!(graph.invokes(), vec![early, late]);
    }

    #[test]
    fn insert_before_and_remove_fixed_keep_the_chain_intact() {
        let mut graph = Graph::new(MethodId(0));
        let ret = graph.insert_after(graph.start(), Node::new(NodeKind::Return));
        let graph_start = graph.start();
        let call = invoke(&mut graph, graph_start, 1);
        assert_eq!(graph.node(graph.start()).unwrap().next(), Some(call));
        assert_eq!(graph.node(call).unwrap().next(), Some(ret));

        let guard = graph.insert_before(
            call,
            Node::new(NodeKind::Deoptimize {
                reason: crate::DeoptReason::UnreachedCode,
            }),
        );
        assert_eq!(graph.predecessor(call), Some(guard));

        graph.remove_fixed(call);
        assert_eq!(graph.node(guard).unwrap().next(), Some(ret));
        assert!(graph.verify().is_ok());
    }

    #[test]
    fn dead_code_removal_keeps_referenced_floating_nodes() {
        let mut graph = Graph::new(MethodId(0));
        let value = graph.add(Node::new(NodeKind::Constant(Constant::Int(3))));
        let unused = graph.add(Node::new(NodeKind::Constant(Constant::Int(4))));
        let ret = graph.insert_after(
            graph.start(),
            Node::new(NodeKind::Return).with_inputs(vec![value]),
        );

        assert_eq!(graph.remove_dead_code(), 1);
        assert!(graph.contains(value));
        assert!(graph.contains(ret));
        assert!(!graph.contains(unused));
    }

    #[test]
    fn frame_state_chain_walks_outer_states() {
        let mut graph = Graph::new(MethodId(0));
        let outer = state(&mut graph, 4, None);
        let inner = state(&mut graph, 1, Some(outer));

        assert_eq!(graph.frame_state_chain(inner), vec![inner, outer]);
        assert_eq!(graph.inlining_depth(inner), 1);
        assert_eq!(graph.inlining_depth(outer), 0);
    }
}
