//! The forest of call-tree nodes discovered by the builder.
//!
//! Nodes live in an arena and are deduplicated by (implementation variant,
//! declared target), so a method reached along several paths has one
//! canonical node holding all its children.

use std::fmt::Write as _;

use ahash::{AHashMap, AHashSet};
use deferc_config::VariantKind;
use deferc_symbol::{MethodId, MethodTable};

use crate::variant::VariantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallTreeNodeId(pub u32);

impl CallTreeNodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where in its parent a node was first discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    /// The method owning the call, which is an inlined callee when the call
    /// sits in inlined code.
    pub method: MethodId,
    pub bci: i32,
}

#[derive(Debug, Clone)]
pub struct CallTreeNode {
    pub variant: VariantId,
    pub method: MethodId,
    pub kind: VariantKind,
    pub target: MethodId,
    pub parent: Option<CallTreeNodeId>,
    pub depth: u32,
    pub position: Option<SourcePosition>,
    pub children: Vec<CallTreeNodeId>,
    /// Node count of the parsed graph, once known.
    pub graph_size: Option<usize>,
}

#[derive(Debug, Default)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
    index: AHashMap<(VariantId, MethodId), CallTreeNodeId>,
    roots: Vec<CallTreeNodeId>,
}

impl CallTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical node for (`variant`, `target`), creating it under
    /// `parent` if it is new. The flag is true for a new node.
    pub fn get_or_insert(
        &mut self,
        variant: VariantId,
        method: MethodId,
        kind: VariantKind,
        target: MethodId,
        parent: Option<CallTreeNodeId>,
        position: Option<SourcePosition>,
    ) -> (CallTreeNodeId, bool) {
        if let Some(id) = self.index.get(&(variant, target)) {
            return (*id, false);
        }

        let depth = parent
            .and_then(|p| self.get(p))
            .map_or(0, |p| p.depth + 1);
        let id = CallTreeNodeId(self.nodes.len() as u32);
        self.nodes.push(CallTreeNode {
            variant,
            method,
            kind,
            target,
            parent,
            depth,
            position,
            children: Vec::new(),
            graph_size: None,
        });
        self.index.insert((variant, target), id);
        if parent.is_none() {
            self.roots.push(id);
        }
        (id, true)
    }

    /// Record `child` under `parent` unless it is already there.
    pub fn attach(&mut self, parent: CallTreeNodeId, child: CallTreeNodeId) {
        if parent == child {
            return;
        }
        if let Some(node) = self.nodes.get_mut(parent.index()) {
            if !node.children.contains(&child) {
                node.children.push(child);
            }
        }
    }

    pub fn get(&self, id: CallTreeNodeId) -> Option<&CallTreeNode> {
        self.nodes.get(id.index())
    }

    pub fn get_mut(&mut self, id: CallTreeNodeId) -> Option<&mut CallTreeNode> {
        self.nodes.get_mut(id.index())
    }

    pub fn lookup(&self, variant: VariantId, target: MethodId) -> Option<CallTreeNodeId> {
        self.index.get(&(variant, target)).copied()
    }

    pub fn roots(&self) -> &[CallTreeNodeId] {
        &self.roots
    }

    pub fn iter(&self) -> impl Iterator<Item = (CallTreeNodeId, &CallTreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (CallTreeNodeId(idx as u32), node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes from a root down to `id`.
    pub fn path_to(&self, id: CallTreeNodeId) -> Vec<CallTreeNodeId> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if path.contains(&node_id) {
                break;
            }
            path.push(node_id);
            current = self.get(node_id).and_then(|node| node.parent);
        }
        path.reverse();
        path
    }

    /// Path to the deepest node; the earliest-created node wins ties.
    pub fn deepest_path(&self) -> Vec<CallTreeNodeId> {
        let deepest = self
            .iter()
            .max_by(|(a_id, a), (b_id, b)| a.depth.cmp(&b.depth).then(b_id.cmp(a_id)))
            .map(|(id, _)| id);
        deepest.map(|id| self.path_to(id)).unwrap_or_default()
    }

    /// Chain from a root to the first node for `method`, rendered one node
    /// per line.
    pub fn call_trace(&self, methods: &MethodTable, method: MethodId) -> Option<String> {
        let (id, _) = self.iter().find(|(_, node)| node.method == method)?;
        Some(self.render_path(methods, &self.path_to(id)))
    }

    pub fn render_path(&self, methods: &MethodTable, path: &[CallTreeNodeId]) -> String {
        let mut out = String::new();
        for id in path {
            self.render_node(&mut out, methods, *id);
        }
        out
    }

    /// One line per node, depth first from each root:
    /// `depth ; indented short name ; graph nodes ; positions ; implementation ; target`.
    /// The target column appears only when it differs from the implementation.
    pub fn render(&self, methods: &MethodTable) -> String {
        let mut out = String::new();
        let mut visited = AHashSet::new();
        let mut stack: Vec<CallTreeNodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            self.render_node(&mut out, methods, id);
            if let Some(node) = self.get(id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    fn render_node(&self, out: &mut String, methods: &MethodTable, id: CallTreeNodeId) {
        let Some(node) = self.get(id) else {
            return;
        };
        let indent = "  ".repeat(node.depth as usize);
        let size = node
            .graph_size
            .map_or_else(|| "-".to_string(), |size| size.to_string());
        let _ = write!(
            out,
            "{} ; {}{} ; {} ; {} ; {}",
            node.depth,
            indent,
            methods.short_name(node.method),
            size,
            self.position_chain(methods, id),
            methods.describe(node.method),
        );
        if node.target != node.method {
            let _ = write!(out, " ; {}", methods.describe(node.target));
        }
        out.push('\n');
    }

    /// `Caller.m@bci <- Outer.n@bci ...` from `id` up to its root.
    fn position_chain(&self, methods: &MethodTable, id: CallTreeNodeId) -> String {
        let positions: Vec<String> = self
            .path_to(id)
            .iter()
            .rev()
            .filter_map(|id| self.get(*id).and_then(|node| node.position))
            .map(|pos| format!("{}@{}", methods.short_name(pos.method), pos.bci))
            .collect();
        positions.join(" <- ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deferc_symbol::MethodFlags;

    fn table() -> (MethodTable, MethodId, MethodId, MethodId) {
        let table = MethodTable::new();
        let main = table.declare("app.Main", "main", "()V", MethodFlags::default());
        let a = table.declare("app.A", "f", "()V", MethodFlags::default());
        let base = table.declare("app.Base", "f", "()V", MethodFlags::default());
        (table, main, a, base)
    }

    #[test]
    fn rediscovery_merges_into_the_canonical_node() {
        let (_, main, a, base) = table();
        let mut tree = CallTree::new();
        let (root, new_root) =
            tree.get_or_insert(VariantId(0), main, VariantKind::Deferred, main, None, None);
        let pos = SourcePosition { method: main, bci: 3 };
        let (child, new_child) =
            tree.get_or_insert(VariantId(1), a, VariantKind::Deferred, base, Some(root), Some(pos));
        tree.attach(root, child);
        let (again, new_again) =
            tree.get_or_insert(VariantId(1), a, VariantKind::Deferred, base, Some(root), Some(pos));
        tree.attach(root, again);

        assert!(new_root && new_child && !new_again);
        assert_eq!(child, again);
        assert_eq!(tree.get(root).unwrap().children, vec![child]);
        assert_eq!(tree.get(child).unwrap().depth, 1);
        assert_eq!(tree.roots(), &[root]);
    }

    #[test]
    fn render_lists_every_node_once() {
        let (methods, main, a, base) = table();
        let mut tree = CallTree::new();
        let (root, _) =
            tree.get_or_insert(VariantId(0), main, VariantKind::Deferred, main, None, None);
        tree.get_mut(root).unwrap().graph_size = Some(12);
        let pos = SourcePosition { method: main, bci: 3 };
        let (child, _) =
            tree.get_or_insert(VariantId(1), a, VariantKind::Deferred, base, Some(root), Some(pos));
        tree.attach(root, child);
        tree.attach(child, root);

        let rendered = tree.render(&methods);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0 ; Main.main ; 12 ;  ; app.Main.main(()V)");
        assert_eq!(
            lines[1],
            "1 ;   A.f ; - ; Main.main@3 ; app.A.f(()V) ; app.Base.f(()V)"
        );
    }

    #[test]
    fn deepest_path_and_call_trace() {
        let (methods, main, a, base) = table();
        let mut tree = CallTree::new();
        let (root, _) =
            tree.get_or_insert(VariantId(0), main, VariantKind::Deferred, main, None, None);
        let (mid, _) = tree.get_or_insert(
            VariantId(1),
            a,
            VariantKind::Deferred,
            a,
            Some(root),
            Some(SourcePosition { method: main, bci: 1 }),
        );
        let (leaf, _) = tree.get_or_insert(
            VariantId(2),
            base,
            VariantKind::Original,
            base,
            Some(mid),
            Some(SourcePosition { method: a, bci: 4 }),
        );

        assert_eq!(tree.deepest_path(), vec![root, mid, leaf]);
        let trace = tree.call_trace(&methods, base).unwrap();
        assert_eq!(trace.lines().count(), 3);
        assert!(trace.lines().last().unwrap().contains("A.f@4 <- Main.main@1"));
        assert!(tree.call_trace(&methods, MethodId(42)).is_none());
    }
}
