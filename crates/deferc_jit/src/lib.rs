//! Call-tree construction and deferred-compilation preparation.
//!
//! The [`CallTreeBuilder`] discovers which methods get a Deferred variant,
//! [`deopt`] collects the points those variants may deoptimize to, and
//! [`pipeline::build`] drives both and encodes the finished graphs.

pub mod builder;
pub mod call_tree;
pub mod deopt;
pub mod error;
pub mod host;
pub mod inline;
pub mod pipeline;
pub mod script;
pub mod variant;

pub use builder::{CallTreeBuilder, CompilationCandidate, LinkedVariant, PassSummary};
pub use call_tree::{CallTree, CallTreeNode, CallTreeNodeId, SourcePosition};
pub use deopt::{DeoptEntries, DeoptEntryKey};
pub use error::{BuildError, ParseFailure};
pub use host::{
    BuildContext, CallSiteRef, CalleeSize, DefaultCandidatePredicate, DeferredCandidatePredicate,
    FrontEnd, ReachabilityOracle,
};
pub use inline::{DeferredInlinePolicy, InlineDecision, InlineDecisionPolicy, NoInlining, ParseContext};
pub use pipeline::{BuildArtifact, Diagnostics, EncodedMethod, build};
pub use script::{LoadedProgram, ProgramScript, ScriptError};
pub use variant::{MethodVariant, VariantId, VariantRegistry};
