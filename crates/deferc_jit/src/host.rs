//! Collaborators the build consumes: the reachability analysis, the front end
//! and the policy deciding which methods may be compiled at run time.

use std::sync::Arc;

use deferc_codec::{IdentityReplacer, ObjectReplacer};
use deferc_config::{BuildConfig, VariantKind};
use deferc_ir::{CallKind, Graph, InvokeData};
use deferc_metrics::BuildProfiler;
use deferc_symbol::{Method, MethodId, MethodTable};

use crate::error::ParseFailure;
use crate::inline::ParseContext;

/// A call site as the reachability analysis sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteRef {
    /// The method whose code contains the call; differs from the graph's
    /// method when the call sits in an inlined callee.
    pub caller: MethodId,
    pub bci: i32,
    pub target: MethodId,
    pub declared: MethodId,
    pub kind: CallKind,
}

impl CallSiteRef {
    pub fn new(caller: MethodId, invoke: &InvokeData) -> Self {
        Self {
            caller,
            bci: invoke.bci,
            target: invoke.target,
            declared: invoke.declared,
            kind: invoke.kind,
        }
    }
}

/// Facts from the whole-program reachability analysis.
pub trait ReachabilityOracle: Send + Sync {
    /// Concrete implementations that may run at `site`.
    fn callees_of(&self, site: &CallSiteRef) -> Vec<MethodId>;

    fn is_reachable(&self, method: MethodId) -> bool;

    /// Called whenever the build creates a variant the analysis has not seen.
    fn on_new_method_discovered(&self, _method: MethodId, _kind: VariantKind) {}

    /// Let the analysis absorb newly discovered methods. Returns true when its
    /// facts changed and another call-tree pass is needed.
    fn advance(&self) -> bool {
        false
    }
}

/// Lowers a method body into a graph.
pub trait FrontEnd: Send + Sync {
    fn build_graph(&self, method: MethodId, ctx: &mut ParseContext<'_>) -> Result<Graph, ParseFailure>;

    /// Rough size of the graph `method` lowers to, used for inlining budgets.
    fn estimated_size(&self, method: MethodId) -> Option<CalleeSize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalleeSize {
    pub nodes: u32,
    pub invokes: u32,
}

/// Decides whether a method may get a Deferred variant at all.
pub trait DeferredCandidatePredicate: Send + Sync {
    fn allow_deferred(&self, method: &Method) -> bool;
}

/// Any method with a body that is not flagged otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCandidatePredicate;

impl DeferredCandidatePredicate for DefaultCandidatePredicate {
    fn allow_deferred(&self, method: &Method) -> bool {
        method.flags.has_body && method.flags.allow_deferred
    }
}

/// Everything one build reads from the outside, passed explicitly so that
/// tests can assemble isolated instances.
pub struct BuildContext<'a> {
    pub config: &'a BuildConfig,
    pub methods: &'a MethodTable,
    pub front_end: &'a dyn FrontEnd,
    pub oracle: &'a dyn ReachabilityOracle,
    pub candidates: &'a dyn DeferredCandidatePredicate,
    pub replacer: Arc<dyn ObjectReplacer>,
    pub profiler: &'a BuildProfiler,
}

impl<'a> BuildContext<'a> {
    /// A context with the default candidate predicate and no shadow objects.
    pub fn new(
        config: &'a BuildConfig,
        methods: &'a MethodTable,
        front_end: &'a dyn FrontEnd,
        oracle: &'a dyn ReachabilityOracle,
        profiler: &'a BuildProfiler,
    ) -> Self {
        Self {
            config,
            methods,
            front_end,
            oracle,
            candidates: &DefaultCandidatePredicate,
            replacer: Arc::new(IdentityReplacer),
            profiler,
        }
    }

    pub fn with_replacer(mut self, replacer: Arc<dyn ObjectReplacer>) -> Self {
        self.replacer = replacer;
        self
    }

    pub fn with_candidates(mut self, candidates: &'a dyn DeferredCandidatePredicate) -> Self {
        self.candidates = candidates;
        self
    }
}
