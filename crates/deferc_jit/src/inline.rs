//! Inlining decisions made while a graph is parsed.
//!
//! A call chain starts in the root scope. Small leaf callees are inlined
//! trivially up to `trivial_max_depth`; anything larger opens an accumulative
//! scope that charges every further inlined callee against one node and invoke
//! budget. Once that budget or the depth limit is hit the scope is exhausted
//! and every later candidate in the chain stays a call edge.

use deferc_config::{InliningConfig, VariantKind};
use deferc_symbol::{Method, MethodId, MethodTable};

use crate::host::CalleeSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineDecision {
    Inline,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineScope {
    Root,
    Trivial {
        depth: u32,
    },
    Accumulative {
        depth: u32,
        nodes: u32,
        invokes: u32,
        exhausted: bool,
    },
}

impl InlineScope {
    pub fn depth(&self) -> u32 {
        match *self {
            InlineScope::Root => 0,
            InlineScope::Trivial { depth } | InlineScope::Accumulative { depth, .. } => depth,
        }
    }
}

/// What the policy knows about a candidate callee.
#[derive(Debug, Clone, Copy)]
pub struct CalleeInfo<'a> {
    pub method: &'a Method,
    pub size: CalleeSize,
    /// The callee already appears in the current inlining chain.
    pub recursive: bool,
}

/// Strategy consulted by the front end at every call site it parses.
pub trait InlineDecisionPolicy: Send + Sync {
    fn decide(&self, scope: &mut InlineScope, callee: &CalleeInfo<'_>) -> InlineDecision;

    /// Scope the body of an inlined callee is parsed in.
    fn open_callee_scope(&self, outer: &InlineScope, callee: &CalleeInfo<'_>) -> InlineScope;

    /// Fold what an inlined callee consumed back into its caller's scope.
    fn commit_callee_scope(&self, outer: &mut InlineScope, callee_scope: &InlineScope);
}

/// Budgeted policy used when parsing Deferred graphs.
#[derive(Debug, Clone, Default)]
pub struct DeferredInlinePolicy {
    config: InliningConfig,
}

impl DeferredInlinePolicy {
    pub fn new(config: InliningConfig) -> Self {
        Self { config }
    }

    fn is_trivial(&self, size: CalleeSize) -> bool {
        size.invokes == 0 && size.nodes <= self.config.trivial_max_nodes
    }

    fn fits(&self, depth: u32, nodes: u32, invokes: u32) -> bool {
        depth <= self.config.allowed_depth
            && nodes <= self.config.allowed_nodes
            && invokes <= self.config.allowed_invokes
    }
}

impl InlineDecisionPolicy for DeferredInlinePolicy {
    fn decide(&self, scope: &mut InlineScope, callee: &CalleeInfo<'_>) -> InlineDecision {
        let flags = callee.method.flags;
        if callee.recursive || flags.never_inline || !flags.has_body {
            return InlineDecision::Edge;
        }

        match scope {
            InlineScope::Root | InlineScope::Trivial { .. } => {
                let depth = scope.depth() + 1;
                if self.is_trivial(callee.size) && depth <= self.config.trivial_max_depth {
                    InlineDecision::Inline
                } else if self.fits(depth, callee.size.nodes, callee.size.invokes) {
                    InlineDecision::Inline
                } else {
                    InlineDecision::Edge
                }
            }
            InlineScope::Accumulative {
                depth,
                nodes,
                invokes,
                exhausted,
            } => {
                if *exhausted {
                    return InlineDecision::Edge;
                }
                let fits = self.fits(
                    *depth + 1,
                    nodes.saturating_add(callee.size.nodes),
                    invokes.saturating_add(callee.size.invokes),
                );
                if fits {
                    InlineDecision::Inline
                } else {
                    *exhausted = true;
                    InlineDecision::Edge
                }
            }
        }
    }

    fn open_callee_scope(&self, outer: &InlineScope, callee: &CalleeInfo<'_>) -> InlineScope {
        let depth = outer.depth() + 1;
        match *outer {
            InlineScope::Accumulative {
                nodes,
                invokes,
                exhausted,
                ..
            } => InlineScope::Accumulative {
                depth,
                nodes: nodes.saturating_add(callee.size.nodes),
                invokes: invokes.saturating_add(callee.size.invokes),
                exhausted,
            },
            InlineScope::Root | InlineScope::Trivial { .. } => {
                if self.is_trivial(callee.size) && depth <= self.config.trivial_max_depth {
                    InlineScope::Trivial { depth }
                } else {
                    InlineScope::Accumulative {
                        depth,
                        nodes: callee.size.nodes,
                        invokes: callee.size.invokes,
                        exhausted: false,
                    }
                }
            }
        }
    }

    fn commit_callee_scope(&self, outer: &mut InlineScope, callee_scope: &InlineScope) {
        if let (
            InlineScope::Accumulative {
                nodes,
                invokes,
                exhausted,
                ..
            },
            InlineScope::Accumulative {
                nodes: callee_nodes,
                invokes: callee_invokes,
                exhausted: callee_exhausted,
                ..
            },
        ) = (outer, callee_scope)
        {
            *nodes = *callee_nodes;
            *invokes = *callee_invokes;
            *exhausted |= *callee_exhausted;
        }
    }
}

/// Leaves every call site as an edge. DeoptTarget and Original graphs keep
/// one frame per method so every program point stays addressable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInlining;

impl InlineDecisionPolicy for NoInlining {
    fn decide(&self, _scope: &mut InlineScope, _callee: &CalleeInfo<'_>) -> InlineDecision {
        InlineDecision::Edge
    }

    fn open_callee_scope(&self, outer: &InlineScope, _callee: &CalleeInfo<'_>) -> InlineScope {
        *outer
    }

    fn commit_callee_scope(&self, _outer: &mut InlineScope, _callee_scope: &InlineScope) {}
}

/// Parsing state handed to the front end for one variant's graph.
pub struct ParseContext<'a> {
    kind: VariantKind,
    methods: &'a MethodTable,
    policy: &'a dyn InlineDecisionPolicy,
    scopes: Vec<InlineScope>,
    call_stack: Vec<MethodId>,
    inlined: Vec<MethodId>,
}

impl<'a> ParseContext<'a> {
    pub fn new(
        kind: VariantKind,
        method: MethodId,
        methods: &'a MethodTable,
        policy: &'a dyn InlineDecisionPolicy,
    ) -> Self {
        Self {
            kind,
            methods,
            policy,
            scopes: vec![InlineScope::Root],
            call_stack: vec![method],
            inlined: Vec::new(),
        }
    }

    pub fn kind(&self) -> VariantKind {
        self.kind
    }

    pub fn methods(&self) -> &'a MethodTable {
        self.methods
    }

    /// Number of inlined frames currently open.
    pub fn depth(&self) -> usize {
        self.call_stack.len().saturating_sub(1)
    }

    pub fn scope(&self) -> InlineScope {
        self.scopes.last().copied().unwrap_or(InlineScope::Root)
    }

    /// Ask the policy whether `callee` is inlined here.
    ///
    /// On success the callee's scope is opened and must be closed with
    /// [`finish_inline`](Self::finish_inline) once its body is parsed.
    pub fn try_inline(&mut self, callee: MethodId, size: CalleeSize) -> bool {
        let Some(method) = self.methods.get(callee) else {
            return false;
        };
        let info = CalleeInfo {
            method: &method,
            size,
            recursive: self.call_stack.contains(&callee),
        };
        let Some(scope) = self.scopes.last_mut() else {
            return false;
        };
        match self.policy.decide(scope, &info) {
            InlineDecision::Edge => false,
            InlineDecision::Inline => {
                let inner = self.policy.open_callee_scope(scope, &info);
                self.scopes.push(inner);
                self.call_stack.push(callee);
                if !self.inlined.contains(&callee) {
                    self.inlined.push(callee);
                }
                true
            }
        }
    }

    pub fn finish_inline(&mut self) {
        if self.scopes.len() < 2 {
            return;
        }
        if let Some(inner) = self.scopes.pop() {
            if let Some(outer) = self.scopes.last_mut() {
                self.policy.commit_callee_scope(outer, &inner);
            }
        }
        self.call_stack.pop();
    }

    /// Methods inlined so far, in first-inlined order.
    pub fn inlined_methods(&self) -> &[MethodId] {
        &self.inlined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deferc_symbol::MethodFlags;

    fn size(nodes: u32, invokes: u32) -> CalleeSize {
        CalleeSize { nodes, invokes }
    }

    fn method(table: &MethodTable, name: &str, flags: MethodFlags) -> MethodId {
        table.declare("app.T", name, "()V", flags)
    }

    #[test]
    fn trivial_callees_inline_up_to_the_trivial_depth() {
        let config = InliningConfig {
            trivial_max_depth: 2,
            allowed_nodes: 0,
            ..InliningConfig::default()
        };
        let table = MethodTable::new();
        let root = method(&table, "root", MethodFlags::default());
        let a = method(&table, "a", MethodFlags::default());
        let b = method(&table, "b", MethodFlags::default());
        let c = method(&table, "c", MethodFlags::default());
        let policy = DeferredInlinePolicy::new(config);
        let mut ctx = ParseContext::new(VariantKind::Deferred, root, &table, &policy);

        assert!(ctx.try_inline(a, size(3, 0)));
        assert_eq!(ctx.scope(), InlineScope::Trivial { depth: 1 });
        assert!(ctx.try_inline(b, size(3, 0)));
        assert_eq!(ctx.scope(), InlineScope::Trivial { depth: 2 });
        // past the trivial depth and no accumulative budget left
        assert!(!ctx.try_inline(c, size(3, 0)));

        ctx.finish_inline();
        ctx.finish_inline();
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.inlined_methods(), &[a, b]);
    }

    #[test]
    fn accumulative_budget_is_sticky_once_exhausted() {
        let config = InliningConfig {
            trivial_max_nodes: 1,
            allowed_nodes: 10,
            ..InliningConfig::default()
        };
        let table = MethodTable::new();
        let root = method(&table, "root", MethodFlags::default());
        let big = method(&table, "big", MethodFlags::default());
        let mid = method(&table, "mid", MethodFlags::default());
        let tiny = method(&table, "tiny", MethodFlags::default());
        let policy = DeferredInlinePolicy::new(config);
        let mut ctx = ParseContext::new(VariantKind::Deferred, root, &table, &policy);

        assert!(ctx.try_inline(big, size(6, 1)));
        assert!(matches!(ctx.scope(), InlineScope::Accumulative { nodes: 6, .. }));
        assert!(!ctx.try_inline(mid, size(5, 0)));
        // exhausted: even a one-node callee is refused now
        assert!(!ctx.try_inline(tiny, size(1, 0)));
        ctx.finish_inline();
        assert_eq!(ctx.scope(), InlineScope::Root);
    }

    #[test]
    fn sibling_callees_share_the_chain_budget() {
        let config = InliningConfig {
            trivial_max_nodes: 0,
            allowed_nodes: 10,
            ..InliningConfig::default()
        };
        let policy = DeferredInlinePolicy::new(config);
        let table = MethodTable::new();
        let callee = table.get(method(&table, "c", MethodFlags::default())).unwrap();
        let info = CalleeInfo {
            method: &callee,
            size: size(4, 0),
            recursive: false,
        };

        let mut outer = InlineScope::Accumulative {
            depth: 1,
            nodes: 4,
            invokes: 0,
            exhausted: false,
        };
        assert_eq!(policy.decide(&mut outer, &info), InlineDecision::Inline);
        let inner = policy.open_callee_scope(&outer, &info);
        policy.commit_callee_scope(&mut outer, &inner);
        assert!(matches!(outer, InlineScope::Accumulative { nodes: 8, .. }));
        assert_eq!(policy.decide(&mut outer, &info), InlineDecision::Edge);
        assert!(matches!(outer, InlineScope::Accumulative { exhausted: true, .. }));
    }

    #[test]
    fn recursive_and_annotated_callees_stay_edges() {
        let table = MethodTable::new();
        let root = method(&table, "root", MethodFlags::default());
        let pinned = method(
            &table,
            "pinned",
            MethodFlags {
                never_inline: true,
                ..MethodFlags::default()
            },
        );
        let native = method(
            &table,
            "native",
            MethodFlags {
                has_body: false,
                ..MethodFlags::default()
            },
        );
        let policy = DeferredInlinePolicy::default();
        let mut ctx = ParseContext::new(VariantKind::Deferred, root, &table, &policy);

        assert!(!ctx.try_inline(root, size(1, 0)));
        assert!(!ctx.try_inline(pinned, size(1, 0)));
        assert!(!ctx.try_inline(native, size(1, 0)));
        assert!(!ctx.try_inline(MethodId(99), size(1, 0)));
        assert!(ctx.inlined_methods().is_empty());
    }

    #[test]
    fn no_inlining_policy_refuses_everything() {
        let table = MethodTable::new();
        let root = method(&table, "root", MethodFlags::default());
        let leaf = method(&table, "leaf", MethodFlags::default());
        let mut ctx = ParseContext::new(VariantKind::DeoptTarget, root, &table, &NoInlining);

        assert!(!ctx.try_inline(leaf, size(1, 0)));
        assert_eq!(ctx.kind(), VariantKind::DeoptTarget);
    }
}
