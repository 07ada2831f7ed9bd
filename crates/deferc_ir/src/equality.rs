//! Structural graph comparison.
//!
//! Two graphs are structurally equal when their live nodes, taken in id order,
//! pair up one to one with equal per-node data and with every edge pointing at
//! the paired node. Object constants compare by content, but sharing must be
//! preserved: if two nodes of one graph reference the same object, the paired
//! nodes of the other graph must reference one object too.

use ahash::AHashMap;

use crate::graph::Graph;
use crate::node::{Constant, NodeId, NodeKind};
use crate::object::HeapObject;

impl Graph {
    pub fn structurally_equals(&self, other: &Graph) -> bool {
        first_difference(self, other).is_none()
    }
}

/// Describe the first structural difference between `a` and `b`, if any.
pub fn first_difference(a: &Graph, b: &Graph) -> Option<String> {
    if a.method() != b.method() {
        return Some(format!("method {} != {}", a.method(), b.method()));
    }
    if a.inlined_methods() != b.inlined_methods() {
        return Some("inlined method lists differ".to_string());
    }

    let left: Vec<NodeId> = a.iter().map(|(id, _)| id).collect();
    let right: Vec<NodeId> = b.iter().map(|(id, _)| id).collect();
    if left.len() != right.len() {
        return Some(format!("node count {} != {}", left.len(), right.len()));
    }

    let order: AHashMap<NodeId, NodeId> = left.iter().copied().zip(right.iter().copied()).collect();
    let mut objects = ObjectPairing::default();

    for (&l, &r) in left.iter().zip(right.iter()) {
        let (Some(ln), Some(rn)) = (a.node(l), b.node(r)) else {
            return Some(format!("node {l} vanished"));
        };
        if !kinds_match(&ln.kind, &rn.kind, &mut objects) {
            return Some(format!(
                "{l}: {} differs from {r}: {}",
                ln.kind.name(),
                rn.kind.name()
            ));
        }
        let mapped = |ids: &[NodeId]| ids.iter().map(|id| order.get(id).copied()).collect::<Vec<_>>();
        let expected_inputs = mapped(&ln.inputs);
        if expected_inputs != rn.inputs.iter().copied().map(Some).collect::<Vec<_>>() {
            return Some(format!("{l}: inputs differ"));
        }
        let expected_successors = mapped(&ln.successors);
        if expected_successors != rn.successors.iter().copied().map(Some).collect::<Vec<_>>() {
            return Some(format!("{l}: successors differ"));
        }
        if ln.state.map(|s| order.get(&s).copied()) != rn.state.map(Some) {
            return Some(format!("{l}: state differs"));
        }
    }
    None
}

#[derive(Default)]
struct ObjectPairing {
    forward: AHashMap<usize, usize>,
    backward: AHashMap<usize, usize>,
}

impl ObjectPairing {
    fn pair(&mut self, left: usize, right: usize) -> bool {
        let forward = *self.forward.entry(left).or_insert(right);
        let backward = *self.backward.entry(right).or_insert(left);
        forward == right && backward == left
    }
}

fn kinds_match(a: &NodeKind, b: &NodeKind, objects: &mut ObjectPairing) -> bool {
    match (a, b) {
        (NodeKind::Constant(Constant::Object(x)), NodeKind::Constant(Constant::Object(y))) => {
            x.value == y.value && objects.pair(HeapObject::identity(x), HeapObject::identity(y))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::Node;
    use deferc_symbol::MethodId;

    fn returning(method: MethodId, constant: Constant) -> Graph {
        let mut graph = Graph::new(method);
        let value = graph.add(Node::new(NodeKind::Constant(constant)));
        graph.insert_after(
            graph.start(),
            Node::new(NodeKind::Return).with_inputs(vec![value]),
        );
        graph
    }

    #[test]
    fn equal_graphs_with_distinct_but_equal_objects() {
        let a = returning(MethodId(1), Constant::Object(HeapObject::string("x")));
        let b = returning(MethodId(1), Constant::Object(HeapObject::string("x")));
        assert!(a.structurally_equals(&b));
    }

    #[test]
    fn holes_in_the_arena_do_not_matter() {
        let mut a = Graph::new(MethodId(1));
        a.add(Node::new(NodeKind::Constant(Constant::Int(9))));
        let value = a.add(Node::new(NodeKind::Constant(Constant::Int(1))));
        a.insert_after(a.start(), Node::new(NodeKind::Return).with_inputs(vec![value]));
        a.remove_dead_code();

        let b = returning(MethodId(1), Constant::Int(1));
        assert_eq!(first_difference(&a, &b), None);
    }

    #[test]
    fn lost_object_sharing_is_a_difference() {
        let shared = HeapObject::string("literal");
        let mut a = Graph::new(MethodId(1));
        let x = a.add(Node::new(NodeKind::Constant(Constant::Object(Arc::clone(&shared)))));
        let y = a.add(Node::new(NodeKind::Constant(Constant::Object(shared))));
        a.insert_after(a.start(), Node::new(NodeKind::Return).with_inputs(vec![x, y]));

        let mut b = Graph::new(MethodId(1));
        let x = b.add(Node::new(NodeKind::Constant(Constant::Object(HeapObject::string("literal")))));
        let y = b.add(Node::new(NodeKind::Constant(Constant::Object(HeapObject::string("literal")))));
        b.insert_after(b.start(), Node::new(NodeKind::Return).with_inputs(vec![x, y]));

        assert!(first_difference(&a, &b).is_some());
    }

    #[test]
    fn different_data_is_reported() {
        let a = returning(MethodId(1), Constant::Int(1));
        let b = returning(MethodId(1), Constant::Int(2));
        let diff = first_difference(&a, &b).unwrap_or_default();
        assert!(diff.contains("Constant"), "{diff}");
    }
}
