//! Worklist fixpoint that discovers which methods need a Deferred variant.
//!
//! Starting from the registered roots, every reachable call edge of every
//! Deferred graph is classified; callees that may be compiled at run time
//! get a Deferred variant of their own and are queued in turn. Parsing a
//! graph can only create variants, never remove them, so the worklist drains
//! after at most three variants per method have been processed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashSet;
use deferc_config::VariantKind;
use deferc_ir::{Graph, NodeId, NodeKind};
use deferc_symbol::MethodId;
use deferc_utils::Stopwatch;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::call_tree::{CallTree, CallTreeNodeId, SourcePosition};
use crate::error::BuildError;
use crate::host::{BuildContext, CallSiteRef};
use crate::inline::{DeferredInlinePolicy, InlineDecisionPolicy, NoInlining, ParseContext};
use crate::variant::{VariantId, VariantRegistry};

/// Reason recorded when the front end cannot produce a graph.
pub const GENERIC_FAILURE: &str = "generic failure";

/// Reason recorded when a Deferred graph keeps memory on the stack.
pub const STACK_VALUE_FAILURE: &str = "stack-allocated value cannot survive deoptimization";

/// An (implementation, declared target) edge seen from a Deferred caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompilationCandidate {
    pub implementation: MethodId,
    pub target: MethodId,
}

/// A call site for which the analysis reported no reachable callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreachableSite {
    pub caller: MethodId,
    pub bci: i32,
    pub target: MethodId,
}

/// A variant linked for one callee; the first entry of a
/// [`determine_callees`](CallTreeBuilder::determine_callees) result is the one
/// the call itself goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedVariant {
    pub kind: VariantKind,
    pub id: VariantId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub expanded: usize,
    pub new_nodes: usize,
    pub unreachable_sites: usize,
}

pub struct CallTreeBuilder<'a> {
    ctx: &'a BuildContext<'a>,
    registry: VariantRegistry,
    tree: CallTree,
    roots: Vec<MethodId>,
    root_set: AHashSet<MethodId>,
    candidates: Mutex<BTreeSet<CompilationCandidate>>,
    unreachable: Mutex<BTreeMap<(VariantId, NodeId), UnreachableSite>>,
    failures: Mutex<BTreeMap<MethodId, String>>,
    /// Methods with a Deferred node in the tree, failed or not.
    deferred_seen: AHashSet<MethodId>,
    /// `deferred_seen` minus the failed methods.
    live_deferred: AtomicUsize,
    budget_warned: bool,
    passes: u32,
}

impl<'a> CallTreeBuilder<'a> {
    pub fn new(ctx: &'a BuildContext<'a>) -> Self {
        Self {
            ctx,
            registry: VariantRegistry::new(),
            tree: CallTree::new(),
            roots: Vec::new(),
            root_set: AHashSet::new(),
            candidates: Mutex::new(BTreeSet::new()),
            unreachable: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(BTreeMap::new()),
            deferred_seen: AHashSet::new(),
            live_deferred: AtomicUsize::new(0),
            budget_warned: false,
            passes: 0,
        }
    }

    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    pub fn roots(&self) -> &[MethodId] {
        &self.roots
    }

    pub fn is_root(&self, method: MethodId) -> bool {
        self.root_set.contains(&method)
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Register an externally requested compilation root.
    pub fn register_root(&mut self, method: MethodId) -> Result<CallTreeNodeId, BuildError> {
        if self.ctx.methods.get(method).is_none() {
            return Err(BuildError::invariant(format!("unknown root method {method}")));
        }
        let kind = self.ctx.config.root_variant.kind();
        if kind == VariantKind::Original && self.roots.is_empty() {
            warn!("roots start in the Original variant; no method will be compiled as Deferred");
        }
        let created = self.registry.get_or_create(method, kind, true);
        self.discovered(method, kind, created.new);
        if kind == VariantKind::Deferred {
            self.link_stub(method, VariantKind::DeoptTarget);
        }
        if self.root_set.insert(method) {
            self.roots.push(method);
        }
        let (node, _) = self
            .tree
            .get_or_insert(created.id, method, kind, method, None, None);
        self.count_deferred(method, kind);
        Ok(node)
    }

    /// Drain the worklist once from every root.
    ///
    /// Running a pass again with unchanged analysis facts leaves the tree as it
    /// is; facts that changed update the unreachable marks and may add nodes.
    pub fn run_pass(&mut self) -> Result<PassSummary, BuildError> {
        self.passes += 1;
        let stopwatch = Stopwatch::start_new();
        let nodes_before = self.tree.len();
        let mut summary = PassSummary::default();
        let mut expanded: AHashSet<VariantId> = AHashSet::new();
        let mut worklist: VecDeque<CallTreeNodeId> = self.tree.roots().iter().copied().collect();

        while let Some(node_id) = worklist.pop_front() {
            let Some(node) = self.tree.get(node_id) else {
                continue;
            };
            let (variant, method, kind, is_tree_root) =
                (node.variant, node.method, node.kind, node.parent.is_none());
            if !expanded.insert(variant) {
                continue;
            }
            if kind == VariantKind::Original && !is_tree_root {
                continue;
            }
            if self.is_failed(method) {
                continue;
            }

            let Some(graph) = self.materialize(variant)? else {
                continue;
            };
            summary.expanded += 1;
            if let Some(node) = self.tree.get_mut(node_id) {
                node.graph_size = Some(graph.node_count());
            }

            if kind == VariantKind::Deferred {
                for inlined in graph.inlined_methods() {
                    self.link_stub(*inlined, VariantKind::Deferred);
                }
            }

            for invoke in graph.invokes() {
                let Some(site) = call_site(&graph, invoke) else {
                    continue;
                };
                let mut callees = self.ctx.oracle.callees_of(&site);
                callees.sort_unstable();
                callees.dedup();

                if callees.is_empty() {
                    self.unreachable.lock().insert(
                        (variant, invoke),
                        UnreachableSite {
                            caller: site.caller,
                            bci: site.bci,
                            target: site.declared,
                        },
                    );
                    summary.unreachable_sites += 1;
                    continue;
                }
                self.unreachable.lock().remove(&(variant, invoke));

                let position = SourcePosition {
                    method: site.caller,
                    bci: site.bci,
                };
                for callee in callees {
                    let linked = self.determine_callees(kind, callee, site.declared)?;
                    let Some(call) = linked.first().copied() else {
                        continue;
                    };
                    self.registry.check_call(kind, call.kind)?;
                    self.registry.check_return(kind, call.kind)?;

                    let (child, new) = self.tree.get_or_insert(
                        call.id,
                        callee,
                        call.kind,
                        site.declared,
                        Some(node_id),
                        Some(position),
                    );
                    self.tree.attach(node_id, child);
                    self.count_deferred(callee, call.kind);
                    if new || !expanded.contains(&call.id) {
                        worklist.push_back(child);
                    }
                }
            }

            self.check_budget()?;
        }

        summary.new_nodes = self.tree.len() - nodes_before;
        info!(
            pass = self.passes,
            expanded = summary.expanded,
            new_nodes = summary.new_nodes,
            unreachable = summary.unreachable_sites,
            elapsed_us = stopwatch.elapsed_us(),
            "call tree pass finished"
        );
        Ok(summary)
    }

    /// Decide which variants of `implementation` a call from a `caller`
    /// variant links against, creating them as needed.
    ///
    /// The first entry is the variant the call goes to; the rest exist only so
    /// that deoptimization and returns can be linked.
    pub fn determine_callees(
        &self,
        caller: VariantKind,
        implementation: MethodId,
        target: MethodId,
    ) -> Result<Vec<LinkedVariant>, BuildError> {
        let candidate = self.is_candidate(implementation);
        let mut linked = Vec::with_capacity(3);

        match caller {
            VariantKind::Original => {
                linked.push(self.link(implementation, VariantKind::Original, false));
                if self.is_root(implementation) && candidate {
                    linked.push(self.link(implementation, VariantKind::DeoptTarget, false));
                    linked.push(self.link(implementation, VariantKind::Deferred, true));
                }
            }
            VariantKind::Deferred => {
                self.candidates.lock().insert(CompilationCandidate {
                    implementation,
                    target,
                });
                if candidate {
                    linked.push(self.link(implementation, VariantKind::Deferred, true));
                    linked.push(self.link(implementation, VariantKind::Original, false));
                    linked.push(self.link(implementation, VariantKind::DeoptTarget, false));
                } else {
                    linked.push(self.link(implementation, VariantKind::Original, false));
                }
            }
            VariantKind::DeoptTarget => {
                linked.push(self.link(implementation, VariantKind::Original, false));
                if candidate {
                    linked.push(self.link(implementation, VariantKind::DeoptTarget, false));
                    linked.push(self.link(implementation, VariantKind::Deferred, false));
                }
            }
        }

        Ok(linked)
    }

    /// Link the callees of a graph that is not expanded in the call tree.
    pub fn link_calls(&self, caller: VariantKind, graph: &Graph) -> Result<usize, BuildError> {
        let mut linked = 0;
        for invoke in graph.invokes() {
            let Some(site) = call_site(graph, invoke) else {
                continue;
            };
            for callee in self.ctx.oracle.callees_of(&site) {
                let variants = self.determine_callees(caller, callee, site.declared)?;
                if let Some(call) = variants.first() {
                    self.registry.check_call(caller, call.kind)?;
                    linked += 1;
                }
            }
        }
        Ok(linked)
    }

    fn is_candidate(&self, method: MethodId) -> bool {
        if self.is_failed(method) {
            return false;
        }
        if self.is_root(method) {
            return true;
        }
        self.ctx
            .methods
            .get(method)
            .is_some_and(|m| self.ctx.candidates.allow_deferred(&m))
    }

    fn link(&self, method: MethodId, kind: VariantKind, eager: bool) -> LinkedVariant {
        let created = self.registry.get_or_create(method, kind, eager);
        self.discovered(method, kind, created.new);
        LinkedVariant {
            kind,
            id: created.id,
        }
    }

    fn link_stub(&self, method: MethodId, kind: VariantKind) -> LinkedVariant {
        self.link(method, kind, false)
    }

    fn discovered(&self, method: MethodId, kind: VariantKind, new: bool) {
        if new {
            self.ctx.oracle.on_new_method_discovered(method, kind);
        }
    }

    /// Parse a variant's graph, recording a failure instead of returning an
    /// error when the method cannot be compiled at run time.
    pub fn materialize(&self, variant: VariantId) -> Result<Option<Arc<Graph>>, BuildError> {
        let handle = self
            .registry
            .get(variant)
            .ok_or_else(|| BuildError::invariant(format!("unknown variant {variant}")))?;
        let (method, kind) = (handle.method(), handle.kind());

        let deferred_policy;
        let policy: &dyn InlineDecisionPolicy = if kind == VariantKind::Deferred {
            deferred_policy = DeferredInlinePolicy::new(self.ctx.config.inlining.clone());
            &deferred_policy
        } else {
            &NoInlining
        };

        let stopwatch = Stopwatch::start_new();
        let mut parsed = false;
        let outcome = self.registry.materialize(variant, |_| {
            parsed = true;
            let mut parse = ParseContext::new(kind, method, self.ctx.methods, policy);
            self.ctx
                .front_end
                .build_graph(method, &mut parse)
                .map_err(|failure| failure.reason)
        })?;

        let graph = match outcome {
            Ok(graph) => graph,
            Err(detail) => {
                if parsed {
                    warn!(
                        method = %self.ctx.methods.describe(method),
                        %kind,
                        %detail,
                        "parsing failed"
                    );
                }
                self.record_failure(method, GENERIC_FAILURE);
                return Ok(None);
            }
        };

        if kind == VariantKind::Deferred
            && graph
                .iter()
                .any(|(_, node)| matches!(node.kind, NodeKind::StackValue { .. }))
        {
            self.registry.invalidate(variant, STACK_VALUE_FAILURE);
            self.record_failure(method, STACK_VALUE_FAILURE);
            return Ok(None);
        }

        if parsed {
            let name = self.ctx.methods.describe(method);
            self.ctx
                .profiler
                .record_graph(&name, kind, stopwatch.elapsed(), graph.node_count());
            debug!(method = %name, %kind, nodes = graph.node_count(), "parsed graph");
        }
        Ok(Some(graph))
    }

    /// Exclude `method` from deferred compilation. The first reason wins.
    pub fn record_failure(&self, method: MethodId, reason: &str) {
        let mut failures = self.failures.lock();
        if !failures.contains_key(&method) {
            warn!(method = %self.ctx.methods.describe(method), reason, "method invalidated for deferred compilation");
            failures.insert(method, reason.to_string());
            if self.deferred_seen.contains(&method) {
                self.live_deferred.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn count_deferred(&mut self, method: MethodId, kind: VariantKind) {
        if kind == VariantKind::Deferred
            && self.deferred_seen.insert(method)
            && !self.is_failed(method)
        {
            self.live_deferred.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of [`deferred_methods`](Self::deferred_methods), kept up to date
    /// as nodes are added and methods fail.
    pub fn deferred_count(&self) -> usize {
        self.live_deferred.load(Ordering::Relaxed)
    }

    pub fn is_failed(&self, method: MethodId) -> bool {
        self.failures.lock().contains_key(&method)
    }

    pub fn failures(&self) -> BTreeMap<MethodId, String> {
        self.failures.lock().clone()
    }

    pub fn candidates(&self) -> Vec<CompilationCandidate> {
        self.candidates.lock().iter().copied().collect()
    }

    /// Call sites of `variant` that are unreachable as of the last pass.
    pub fn unreachable_sites(&self, variant: VariantId) -> Vec<NodeId> {
        self.unreachable
            .lock()
            .keys()
            .filter(|(owner, _)| *owner == variant)
            .map(|(_, invoke)| *invoke)
            .collect()
    }

    /// Distinct methods in the tree that will be compiled in the Deferred variant.
    pub fn deferred_methods(&self) -> Vec<(MethodId, VariantId)> {
        let failures = self.failures.lock();
        let methods: BTreeMap<MethodId, VariantId> = self
            .tree
            .iter()
            .filter(|(_, node)| node.kind == VariantKind::Deferred)
            .filter(|(_, node)| !failures.contains_key(&node.method))
            .map(|(_, node)| (node.method, node.variant))
            .collect();
        methods.into_iter().collect()
    }

    fn check_budget(&mut self) -> Result<(), BuildError> {
        let count = self.deferred_count();
        if !self.ctx.config.exceeds_budget(count) {
            return Ok(());
        }
        let deepest_path = self
            .tree
            .render_path(self.ctx.methods, &self.tree.deepest_path());
        let max = self.ctx.config.max_methods;
        if self.ctx.config.enforce_max_methods {
            return Err(BuildError::BudgetExceeded {
                count,
                max,
                deepest_path,
            });
        }
        if !self.budget_warned {
            self.budget_warned = true;
            warn!(count, max, "number of methods for deferred compilation exceeds the allowed limit\n{deepest_path}");
        }
        Ok(())
    }

    pub fn render_candidates(&self) -> String {
        let methods = self.ctx.methods;
        let mut lines: Vec<String> = self
            .candidates
            .lock()
            .iter()
            .map(|candidate| {
                if candidate.implementation == candidate.target {
                    methods.describe(candidate.implementation)
                } else {
                    format!(
                        "{} (via {})",
                        methods.describe(candidate.implementation),
                        methods.describe(candidate.target)
                    )
                }
            })
            .collect();
        let mut pruned: Vec<String> = self
            .unreachable
            .lock()
            .values()
            .map(|site| {
                format!(
                    "[pruned] {} at {}@{}",
                    methods.describe(site.target),
                    methods.short_name(site.caller),
                    site.bci
                )
            })
            .collect();
        lines.sort();
        pruned.sort();
        pruned.dedup();
        lines.extend(pruned);

        let mut out = String::new();
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
        out
    }

    pub fn render_methods(&self) -> String {
        let mut names: Vec<String> = self
            .deferred_methods()
            .into_iter()
            .map(|(method, _)| self.ctx.methods.describe(method))
            .collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let _ = writeln!(out, "{name}");
        }
        out
    }

    /// Hand the results over once the fixpoint is reached.
    pub fn into_parts(self) -> BuilderParts {
        BuilderParts {
            registry: self.registry,
            tree: self.tree,
            candidates: self.candidates.into_inner().into_iter().collect(),
            failures: self.failures.into_inner(),
        }
    }
}

pub struct BuilderParts {
    pub registry: VariantRegistry,
    pub tree: CallTree,
    pub candidates: Vec<CompilationCandidate>,
    pub failures: BTreeMap<MethodId, String>,
}

/// The call site an invoke node stands for, attributed to the frame that owns it.
fn call_site(graph: &Graph, invoke: NodeId) -> Option<CallSiteRef> {
    let node = graph.node(invoke)?;
    let data = node.kind.invoke()?;
    let caller = node
        .state
        .and_then(|state| graph.kind(state))
        .and_then(NodeKind::frame_state)
        .map_or(graph.method(), |state| state.method);
    Some(CallSiteRef::new(caller, data))
}


#[cfg(test)]
mod tests {
    use crate::host::ReachabilityOracle;
    use super::*;
    use crate::script::{LoadedProgram, MethodScript, Op, ProgramScript};
    use deferc_config::{BuildConfig, RootVariant};
    use deferc_metrics::BuildProfiler;
    use std::collections::BTreeMap as Map;

    fn virtual_dispatch() -> ProgramScript {
        ProgramScript {
            methods: vec![
                MethodScript::new(
                    "app.Main",
                    "main",
                    vec![
                        Op::Param { index: 0 },
                        Op::string("literal"),
                        Op::Call {
                            target: "app.Base.f".to_string(),
                            is_virtual: true,
                            args: 2,
                            receiver: true,
                            catches: false,
                        },
                        Op::Return,
                    ],
                ),
                MethodScript {
                    has_body: false,
                    ..MethodScript::new("app.Base", "f", Vec::new())
                },
                MethodScript::new("app.A", "f", vec![Op::string("literal"), Op::Return]),
                MethodScript::new("app.B", "f", vec![Op::string("literal"), Op::Return]),
            ],
            roots: vec!["app.Main.main".to_string()],
            unreachable: Vec::new(),
            reachable_later: Vec::new(),
            implementations: Map::from([(
                "app.Base.f".to_string(),
                vec!["app.A.f".to_string(), "app.B.f".to_string()],
            )]),
        }
    }

    fn run<R>(
        script: &ProgramScript,
        config: BuildConfig,
        f: impl FnOnce(&mut CallTreeBuilder<'_>, &LoadedProgram) -> R,
    ) -> R {
        let loaded = script.load().unwrap();
        let profiler = BuildProfiler::new();
        let ctx = BuildContext::new(
            &config,
            &loaded.methods,
            &loaded.front_end,
            &loaded.oracle,
            &profiler,
        );
        let mut builder = CallTreeBuilder::new(&ctx);
        for root in &loaded.roots {
            builder.register_root(*root).unwrap();
        }
        f(&mut builder, &loaded)
    }

    fn id(loaded: &LoadedProgram, name: &str) -> MethodId {
        loaded.methods.resolve(name).unwrap()
    }

    #[test]
    fn virtual_callees_become_deferred_children() {
        run(&virtual_dispatch(), BuildConfig::default(), |builder, loaded| {
            builder.run_pass().unwrap();
            let (main, base, a, b) = (
                id(loaded, "app.Main.main"),
                id(loaded, "app.Base.f"),
                id(loaded, "app.A.f"),
                id(loaded, "app.B.f"),
            );

            let tree = builder.tree();
            let root = tree.get(tree.roots()[0]).unwrap();
            assert_eq!((root.method, root.kind), (main, VariantKind::Deferred));
            let children: Vec<(MethodId, VariantKind, MethodId)> = root
                .children
                .iter()
                .map(|child| tree.get(*child).unwrap())
                .map(|child| (child.method, child.kind, child.target))
                .collect();
            assert_eq!(
                children,
                vec![
                    (a, VariantKind::Deferred, base),
                    (b, VariantKind::Deferred, base)
                ]
            );

            let methods: Vec<MethodId> = builder.deferred_methods().iter().map(|(m, _)| *m).collect();
            assert_eq!(methods, vec![main, a, b]);
            for method in [main, a, b] {
                let deopt = builder.registry().lookup(method, VariantKind::DeoptTarget).unwrap();
                assert!(builder.registry().is_stub(deopt));
            }
            assert_eq!(
                builder.candidates(),
                vec![
                    CompilationCandidate {
                        implementation: a,
                        target: base
                    },
                    CompilationCandidate {
                        implementation: b,
                        target: base
                    },
                ]
            );
            assert!(loaded.oracle.discovered().contains(&(a, VariantKind::Deferred)));
        });
    }

    #[test]
    fn every_tree_edge_respects_the_call_matrix() {
        let mut script = virtual_dispatch();
        script.methods[3].no_deferred = true;
        run(&script, BuildConfig::default(), |builder, loaded| {
            builder.run_pass().unwrap();
            let tree = builder.tree();
            let mut kinds = Vec::new();
            for (_, node) in tree.iter() {
                for child in &node.children {
                    let child = tree.get(*child).unwrap();
                    assert!(node.kind.may_call(child.kind));
                    assert!(node.kind.may_be_returned_into_from(child.kind));
                    kinds.push(child.kind);
                }
            }
            assert_eq!(kinds, vec![VariantKind::Deferred, VariantKind::Original]);

            // the edge to the excluded implementation is still reported
            let base = id(loaded, "app.Base.f");
            let edges: Vec<(MethodId, MethodId)> = builder
                .candidates()
                .iter()
                .map(|c| (c.implementation, c.target))
                .collect();
            assert_eq!(
                edges,
                vec![(id(loaded, "app.A.f"), base), (id(loaded, "app.B.f"), base)]
            );
            assert!(builder.render_candidates().contains("app.B.f(())"));
        });
    }

    #[test]
    fn determine_callees_follows_the_caller_variant() {
        let mut script = virtual_dispatch();
        script.methods[3].no_deferred = true;
        run(&script, BuildConfig::default(), |builder, loaded| {
            let (main, a, b) = (
                id(loaded, "app.Main.main"),
                id(loaded, "app.A.f"),
                id(loaded, "app.B.f"),
            );
            let kinds = |linked: Vec<LinkedVariant>| -> Vec<VariantKind> {
                linked.into_iter().map(|v| v.kind).collect()
            };

            use VariantKind::*;
            assert_eq!(kinds(builder.determine_callees(Original, a, a).unwrap()), vec![Original]);
            assert_eq!(
                kinds(builder.determine_callees(Original, main, main).unwrap()),
                vec![Original, DeoptTarget, Deferred]
            );
            assert_eq!(
                kinds(builder.determine_callees(Deferred, a, a).unwrap()),
                vec![Deferred, Original, DeoptTarget]
            );
            assert_eq!(kinds(builder.determine_callees(Deferred, b, b).unwrap()), vec![Original]);
            assert_eq!(
                kinds(builder.determine_callees(DeoptTarget, a, a).unwrap()),
                vec![Original, DeoptTarget, Deferred]
            );
            assert!(builder.registry().lookup(b, Deferred).is_none());
            assert!(builder.candidates().contains(&CompilationCandidate {
                implementation: b,
                target: b
            }));
        });
    }

    #[test]
    fn parse_failures_are_local() {
        let mut script = virtual_dispatch();
        script.methods[2].fail = Some("unsupported bytecode".to_string());
        script.methods[3].ops = vec![Op::StackAlloc { size: 16 }, Op::Return];
        run(&script, BuildConfig::default(), |builder, loaded| {
            builder.run_pass().unwrap();
            let (main, a, b) = (
                id(loaded, "app.Main.main"),
                id(loaded, "app.A.f"),
                id(loaded, "app.B.f"),
            );

            let failures = builder.failures();
            assert_eq!(failures.get(&a).map(String::as_str), Some(GENERIC_FAILURE));
            assert_eq!(failures.get(&b).map(String::as_str), Some(STACK_VALUE_FAILURE));
            let methods: Vec<MethodId> = builder.deferred_methods().iter().map(|(m, _)| *m).collect();
            assert_eq!(methods, vec![main]);

            // a failed method is no longer a candidate
            let linked = builder.determine_callees(VariantKind::Deferred, a, a).unwrap();
            assert_eq!(linked[0].kind, VariantKind::Original);
        });
    }

    #[test]
    fn unreachable_sites_are_marked_then_cleared() {
        let mut script = virtual_dispatch();
        script.reachable_later = vec!["app.A.f".to_string(), "app.B.f".to_string()];
        run(&script, BuildConfig::default(), |builder, loaded| {
            let summary = builder.run_pass().unwrap();
            let root_variant = builder.tree().get(builder.tree().roots()[0]).unwrap().variant;
            assert_eq!(summary.unreachable_sites, 1);
            assert_eq!(builder.unreachable_sites(root_variant).len(), 1);
            assert!(builder.render_candidates().contains("[pruned] app.Base.f(()) at Main.main@3"));

            assert!(loaded.oracle.advance());
            let summary = builder.run_pass().unwrap();
            assert_eq!(summary.unreachable_sites, 0);
            assert_eq!(summary.new_nodes, 2);
            assert!(builder.unreachable_sites(root_variant).is_empty());
        });
    }

    #[test]
    fn passes_are_idempotent() {
        run(&virtual_dispatch(), BuildConfig::default(), |builder, _| {
            builder.run_pass().unwrap();
            let nodes = builder.tree().len();
            let variants = builder.registry().len();
            let rendered = builder.render_candidates();

            let summary = builder.run_pass().unwrap();

            assert_eq!(summary.new_nodes, 0);
            assert_eq!(builder.tree().len(), nodes);
            assert_eq!(builder.registry().len(), variants);
            assert_eq!(builder.render_candidates(), rendered);
            assert_eq!(builder.passes(), 2);
        });
    }

    #[test]
    fn mutual_recursion_terminates() {
        let never = |owner: &str, name: &str, ops: Vec<Op>| MethodScript {
            never_inline: true,
            ..MethodScript::new(owner, name, ops)
        };
        let script = ProgramScript {
            methods: vec![
                never("app.R", "even", vec![Op::call("app.R.odd"), Op::Return]),
                never("app.R", "odd", vec![Op::call("app.R.even"), Op::Return]),
            ],
            roots: vec!["app.R.even".to_string()],
            unreachable: Vec::new(),
            reachable_later: Vec::new(),
            implementations: Map::new(),
        };
        run(&script, BuildConfig::default(), |builder, _| {
            let summary = builder.run_pass().unwrap();
            assert_eq!(summary.expanded, 2);
            assert_eq!(builder.tree().len(), 2);
            // Original, Deferred and DeoptTarget of each method
            assert_eq!(builder.registry().len(), 6);
        });
    }

    #[test]
    fn budget_overrun_warns_or_aborts() {
        let lenient = BuildConfig {
            max_methods: 2,
            ..BuildConfig::default()
        };
        run(&virtual_dispatch(), lenient, |builder, _| {
            assert!(builder.run_pass().is_ok());
            assert_eq!(builder.deferred_methods().len(), 3);
        });

        let strict = BuildConfig {
            max_methods: 2,
            enforce_max_methods: true,
            ..BuildConfig::default()
        };
        run(&virtual_dispatch(), strict, |builder, _| {
            let err = builder.run_pass().unwrap_err();
            let BuildError::BudgetExceeded {
                count,
                max,
                deepest_path,
            } = err
            else {
                panic!("expected a budget error, got {err}");
            };
            assert_eq!((count, max), (3, 2));
            assert!(deepest_path.contains("Main.main"));
            assert!(deepest_path.contains("A.f"));
        });
    }

    #[test]
    fn original_roots_compile_nothing_deferred() {
        let config = BuildConfig {
            root_variant: RootVariant::Original,
            print_candidates: true,
            ..BuildConfig::default()
        };
        run(&virtual_dispatch(), config, |builder, loaded| {
            builder.run_pass().unwrap();
            let main = id(loaded, "app.Main.main");

            let tree = builder.tree();
            let root = tree.get(tree.roots()[0]).unwrap();
            assert_eq!((root.method, root.kind), (main, VariantKind::Original));
            assert!(tree.iter().all(|(_, node)| node.kind == VariantKind::Original));
            assert!(builder.deferred_methods().is_empty());
            assert_eq!(builder.deferred_count(), 0);
            assert!(builder.candidates().is_empty());
        });
    }

    #[test]
    fn failed_methods_leave_the_deferred_count() {
        let mut script = virtual_dispatch();
        script.methods[2].fail = Some("unsupported bytecode".to_string());
        let strict = BuildConfig {
            max_methods: 3,
            enforce_max_methods: true,
            ..BuildConfig::default()
        };
        run(&script, strict, |builder, loaded| {
            builder.run_pass().unwrap();
            assert_eq!(builder.deferred_count(), 2);
            assert_eq!(builder.deferred_count(), builder.deferred_methods().len());

            // failing a method twice or failing one outside the tree changes nothing
            builder.record_failure(id(loaded, "app.A.f"), "again");
            builder.record_failure(id(loaded, "app.Base.f"), "not deferred");
            assert_eq!(builder.deferred_count(), 2);

            builder.record_failure(id(loaded, "app.B.f"), "late");
            assert_eq!(builder.deferred_count(), 1);
            assert_eq!(builder.deferred_count(), builder.deferred_methods().len());

            // a second pass adds nothing and keeps the count
            builder.run_pass().unwrap();
            assert_eq!(builder.deferred_count(), 1);
        });
    }

    #[test]
    fn inlined_methods_get_stub_deferred_variants() {
        let script = ProgramScript {
            methods: vec![
                MethodScript::new("app.Main", "main", vec![Op::call("app.Util.leaf"), Op::Return]),
                MethodScript::new("app.Util", "leaf", vec![Op::string("literal"), Op::Return]),
            ],
            roots: vec!["app.Main.main".to_string()],
            unreachable: Vec::new(),
            reachable_later: Vec::new(),
            implementations: Map::new(),
        };
        run(&script, BuildConfig::default(), |builder, loaded| {
            builder.run_pass().unwrap();
            let leaf = id(loaded, "app.Util.leaf");
            let variant = builder.registry().lookup(leaf, VariantKind::Deferred).unwrap();
            assert!(builder.registry().is_stub(variant));
            assert_eq!(builder.tree().len(), 1);
        });
    }
}
