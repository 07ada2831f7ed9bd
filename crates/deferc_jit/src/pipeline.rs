//! The whole build: call-tree fixpoint, deopt entry registration, pruning,
//! DeoptTarget finishing and encoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use deferc_codec::{EncodedArtifact, GraphDecoder, GraphEncoder, SharedGraphEncoder};
use deferc_config::VariantKind;
use deferc_ir::{Graph, first_difference};
use deferc_symbol::{MethodId, MethodTable};
use deferc_utils::{BuildPhase, PhaseTimings};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::builder::{CallTreeBuilder, CompilationCandidate};
use crate::call_tree::CallTree;
use crate::deopt::{
    CleanupSummary, DeoptEntries, check_exposed, cleanup_deopt_target, collect_entries,
    prune_unreachable_call,
};
use crate::error::BuildError;
use crate::host::BuildContext;
use crate::variant::{VariantId, VariantRegistry};

/// Dumps requested through the configuration, rendered once the fixpoint is reached.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub call_tree: Option<String>,
    pub candidates: Option<String>,
    pub methods: Option<String>,
}

/// Per-method line of the artifact manifest.
#[derive(Debug, Clone, Serialize)]
pub struct EncodedMethod {
    pub method: String,
    pub offset: usize,
    pub bytes: usize,
}

pub struct BuildArtifact {
    pub encoded: EncodedArtifact,
    /// Start of each Deferred method's graph in `encoded.encoding`.
    pub offsets: BTreeMap<MethodId, usize>,
    /// Methods excluded from deferred compilation, with the reason.
    pub failures: BTreeMap<MethodId, String>,
    pub tree: CallTree,
    pub registry: VariantRegistry,
    pub candidates: Vec<CompilationCandidate>,
    pub deopt_entries: DeoptEntries,
    pub diagnostics: Diagnostics,
    pub passes: u32,
    pub phases: PhaseTimings,
}

impl BuildArtifact {
    pub fn deferred_methods(&self) -> Vec<MethodId> {
        self.offsets.keys().copied().collect()
    }

    /// Manifest lines in method order.
    pub fn encoded_methods(&self, methods: &MethodTable) -> Vec<EncodedMethod> {
        let mut starts: Vec<(usize, MethodId)> =
            self.offsets.iter().map(|(method, offset)| (*offset, *method)).collect();
        starts.sort_unstable();
        let total = self.encoded.encoding.len();
        let mut lines: Vec<EncodedMethod> = starts
            .iter()
            .enumerate()
            .map(|(idx, (offset, method))| {
                let end = starts.get(idx + 1).map_or(total, |(next, _)| *next);
                EncodedMethod {
                    method: methods.describe(*method),
                    offset: *offset,
                    bytes: end - offset,
                }
            })
            .collect();
        lines.sort_by(|a, b| a.method.cmp(&b.method));
        lines
    }
}

/// Run a complete build for `roots`.
pub fn build(ctx: &BuildContext<'_>, roots: &[MethodId]) -> Result<BuildArtifact, BuildError> {
    let mut phases = PhaseTimings::new();
    let mut builder = CallTreeBuilder::new(ctx);
    for root in roots {
        builder.register_root(*root)?;
    }

    phases.time(BuildPhase::CallTree, || run_fixpoint(ctx, &mut builder))?;

    let diagnostics = Diagnostics {
        call_tree: ctx
            .config
            .print_call_tree
            .then(|| builder.tree().render(ctx.methods)),
        candidates: ctx
            .config
            .print_candidates
            .then(|| builder.render_candidates()),
        methods: ctx.config.print_methods.then(|| builder.render_methods()),
    };

    let deferred = builder.deferred_methods();
    let graphs = deferred_graphs(&builder, &deferred);

    let entries = DeoptEntries::new();
    phases.time(BuildPhase::DeoptEntries, || {
        register_entries(&builder, &graphs, &entries)
    })?;
    let pruned = phases.time(BuildPhase::Prune, || prune(&builder, &graphs))?;

    for method in entries.methods() {
        let created = builder
            .registry()
            .get_or_create(method, VariantKind::DeoptTarget, true);
        if created.new {
            ctx.oracle
                .on_new_method_discovered(method, VariantKind::DeoptTarget);
        }
        ctx.profiler
            .record_deopt_entry_points(&ctx.methods.describe(method), entries.entries_of(method).len());
    }
    entries.seal();

    let cleanup = phases.time(BuildPhase::DeoptTargets, || {
        finish_deopt_targets(&builder, &entries)
    })?;

    let (encoded, offsets) = phases.time(BuildPhase::Encode, || encode(ctx, &builder, &deferred))?;

    ctx.profiler.update_counters(|counters| {
        counters.passes = builder.passes();
        counters.pruned_call_sites = pruned;
        counters.deopt_entries = entries.len();
        counters.encoded_bytes = encoded.encoding.len();
        counters.table_objects = encoded.objects.len();
    });
    info!(
        deferred = offsets.len(),
        deopt_entries = entries.len(),
        deopt_targets_kept = cleanup.kept,
        deopt_targets_proxified = cleanup.proxified,
        deopt_targets_removed = cleanup.removed,
        bytes = encoded.encoding.len(),
        objects = encoded.objects.len(),
        elapsed_us = phases.total().as_micros() as u64,
        slowest = %phases.slowest().map_or("none", |timing| timing.phase.name()),
        "deferred compilation build finished"
    );

    let passes = builder.passes();
    let parts = builder.into_parts();
    ctx.profiler
        .update_counters(|counters| counters.failures = parts.failures.len());
    Ok(BuildArtifact {
        encoded,
        offsets,
        failures: parts.failures,
        tree: parts.tree,
        registry: parts.registry,
        candidates: parts.candidates,
        deopt_entries: entries,
        diagnostics,
        passes,
        phases,
    })
}

/// Alternate call-tree passes with the analysis until neither adds anything.
fn run_fixpoint(ctx: &BuildContext<'_>, builder: &mut CallTreeBuilder<'_>) -> Result<(), BuildError> {
    loop {
        builder.run_pass()?;
        if builder.passes() >= ctx.config.max_passes.max(1) {
            debug!(passes = builder.passes(), "pass limit reached");
            return Ok(());
        }
        if !ctx.oracle.advance() {
            return Ok(());
        }
    }
}

struct DeferredGraph {
    method: MethodId,
    variant: VariantId,
    is_root: bool,
}

fn deferred_graphs(builder: &CallTreeBuilder<'_>, deferred: &[(MethodId, VariantId)]) -> Vec<DeferredGraph> {
    deferred
        .iter()
        .map(|(method, variant)| DeferredGraph {
            method: *method,
            variant: *variant,
            is_root: builder.is_root(*method),
        })
        .collect()
}

fn graph_of(builder: &CallTreeBuilder<'_>, variant: VariantId) -> Result<Arc<Graph>, BuildError> {
    builder
        .registry()
        .get(variant)
        .and_then(|handle| handle.graph())
        .ok_or_else(|| BuildError::invariant(format!("variant {variant} has no graph")))
}

fn register_entries(
    builder: &CallTreeBuilder<'_>,
    graphs: &[DeferredGraph],
    entries: &DeoptEntries,
) -> Result<(), BuildError> {
    graphs.par_iter().try_for_each(|deferred| {
        let graph = graph_of(builder, deferred.variant)?;
        collect_entries(&graph, deferred.is_root, entries).map(|_| ())
    })
}

fn prune(builder: &CallTreeBuilder<'_>, graphs: &[DeferredGraph]) -> Result<usize, BuildError> {
    let mut pruned = 0;
    for deferred in graphs {
        let sites = builder.unreachable_sites(deferred.variant);
        if sites.is_empty() {
            continue;
        }
        let outcome = builder
            .registry()
            .update_graph(deferred.variant, |graph| -> Result<usize, BuildError> {
                let mut count = 0;
                for site in &sites {
                    // an earlier prune may already have removed this call as dead code
                    if graph.contains(*site) {
                        prune_unreachable_call(graph, *site)?;
                        count += 1;
                    }
                }
                Ok(count)
            })
            .ok_or_else(|| {
                BuildError::invariant(format!("variant {} has no graph to prune", deferred.variant))
            })?;
        pruned += outcome?;
        debug!(method = %deferred.method, sites = sites.len(), "pruned unreachable calls");
    }
    Ok(pruned)
}

/// Parse, link and clean up the DeoptTarget variant of every method with entries.
fn finish_deopt_targets(
    builder: &CallTreeBuilder<'_>,
    entries: &DeoptEntries,
) -> Result<CleanupSummary, BuildError> {
    let summaries: Vec<CleanupSummary> = entries
        .methods()
        .par_iter()
        .map(|method| -> Result<CleanupSummary, BuildError> {
            let registry = builder.registry();
            let variant = registry.require(*method, VariantKind::DeoptTarget)?;
            let Some(graph) = builder.materialize(variant)? else {
                return Ok(CleanupSummary::default());
            };

            builder.link_calls(VariantKind::DeoptTarget, &graph)?;

            let summary = registry
                .update_graph(variant, |graph| {
                    let summary = cleanup_deopt_target(graph, entries);
                    check_exposed(graph, entries).map(|()| summary)
                })
                .transpose()?;
            Ok(summary.unwrap_or_default())
        })
        .collect::<Result<_, _>>()?;

    Ok(summaries
        .into_iter()
        .fold(CleanupSummary::default(), |total, summary| CleanupSummary {
            kept: total.kept + summary.kept,
            proxified: total.proxified + summary.proxified,
            removed: total.removed + summary.removed,
        }))
}

/// Encode every Deferred graph into one buffer and drop the graphs.
///
/// Graphs are prepared and encoded in method order so that table ids and
/// offsets do not depend on scheduling.
fn encode(
    ctx: &BuildContext<'_>,
    builder: &CallTreeBuilder<'_>,
    deferred: &[(MethodId, VariantId)],
) -> Result<(EncodedArtifact, BTreeMap<MethodId, usize>), BuildError> {
    let graphs: Vec<(MethodId, VariantId, Arc<Graph>)> = deferred
        .iter()
        .filter(|(method, _)| !builder.is_failed(*method))
        .map(|(method, variant)| Ok((*method, *variant, graph_of(builder, *variant)?)))
        .collect::<Result<_, BuildError>>()?;

    graphs
        .par_iter()
        .try_for_each(|(method, _, graph)| {
            graph.verify().map_err(|reason| {
                BuildError::invariant(format!(
                    "graph of {} is malformed: {reason}",
                    ctx.methods.describe(*method)
                ))
            })
        })?;

    let encoder = SharedGraphEncoder::new(GraphEncoder::new(Arc::clone(&ctx.replacer)));
    for (_, _, graph) in &graphs {
        encoder.prepare(graph)?;
    }
    encoder.finish_prepare();

    let mut offsets = BTreeMap::new();
    for (method, variant, graph) in &graphs {
        let offset = encoder.encode(graph)?;
        let end = encoder.with(|encoder| encoder.encoding().len());
        builder.registry().record_encoded_offset(*variant, offset)?;
        ctx.profiler
            .record_encoded(&ctx.methods.describe(*method), end - offset);
        offsets.insert(*method, offset);
    }
    let artifact = encoder.into_inner().into_artifact();
    info!(
        graphs = graphs.len(),
        bytes = artifact.encoding.len(),
        objects = artifact.objects.len(),
        "encoded deferred graphs"
    );

    if ctx.config.verify_encoding {
        verify_encoding(ctx, &artifact, &graphs, &offsets)?;
    }
    for (_, variant, _) in &graphs {
        builder.registry().clear_graph(*variant);
    }
    Ok((artifact, offsets))
}

/// Decode every graph again and compare it with what was encoded.
fn verify_encoding(
    ctx: &BuildContext<'_>,
    artifact: &EncodedArtifact,
    graphs: &[(MethodId, VariantId, Arc<Graph>)],
    offsets: &BTreeMap<MethodId, usize>,
) -> Result<(), BuildError> {
    let decoder = GraphDecoder::new(&artifact.encoding, &artifact.objects, Arc::clone(&ctx.replacer));
    graphs.par_iter().try_for_each(|(method, _, graph)| {
        let offset = offsets.get(method).copied().ok_or_else(|| {
            BuildError::invariant(format!("no encoded offset for {}", ctx.methods.describe(*method)))
        })?;
        let decoded = decoder.decode(offset)?;
        match first_difference(graph, &decoded) {
            None => Ok(()),
            Some(difference) => Err(BuildError::EncodingMismatch {
                method: ctx.methods.describe(*method),
                difference,
            }),
        }
    })?;
    debug!(graphs = graphs.len(), "encoding verified");
    Ok(())
}
