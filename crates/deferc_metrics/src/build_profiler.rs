//! Build statistics for deferred compilation.

use std::time::Duration;

use ahash::AHashMap;
use deferc_config::VariantKind;
use parking_lot::RwLock;
use serde::Serialize;

/// Statistics for graphs built in one variant kind
#[derive(Debug, Clone, Serialize)]
pub struct VariantBuildStats {
    /// Number of graphs built
    pub graph_count: u64,

    /// Total time spent building (microseconds)
    pub total_time_us: u64,

    /// Minimum build time (microseconds)
    pub min_time_us: u64,

    /// Maximum build time (microseconds)
    pub max_time_us: u64,

    /// Total IR nodes over all graphs
    pub total_nodes: usize,
}

impl Default for VariantBuildStats {
    fn default() -> Self {
        Self {
            graph_count: 0,
            total_time_us: 0,
            min_time_us: u64::MAX,
            max_time_us: 0,
            total_nodes: 0,
        }
    }
}

impl VariantBuildStats {
    pub fn record(&mut self, duration_us: u64, nodes: usize) {
        self.graph_count += 1;
        self.total_time_us += duration_us;
        self.total_nodes += nodes;
        self.min_time_us = self.min_time_us.min(duration_us);
        self.max_time_us = self.max_time_us.max(duration_us);
    }

    /// Average build time (microseconds)
    pub fn avg_time_us(&self) -> f64 {
        if self.graph_count == 0 {
            0.0
        } else {
            self.total_time_us as f64 / self.graph_count as f64
        }
    }

    pub fn avg_nodes(&self) -> f64 {
        if self.graph_count == 0 {
            0.0
        } else {
            self.total_nodes as f64 / self.graph_count as f64
        }
    }
}

/// Per-method statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MethodBuildStats {
    pub method: String,

    /// Node count of each variant's graph
    pub nodes_per_variant: Vec<(VariantKind, usize)>,

    /// Deopt entry points kept in the DeoptTarget graph
    pub deopt_entry_points: usize,

    /// Encoded size in bytes
    pub encoded_bytes: usize,
}

/// Whole-build counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildCounters {
    pub passes: u32,
    pub pruned_call_sites: usize,
    pub deopt_entries: usize,
    pub failures: usize,
    pub encoded_bytes: usize,
    pub table_objects: usize,
}

/// Collects statistics while a build runs; shareable across worker threads.
#[derive(Default)]
pub struct BuildProfiler {
    variant_stats: RwLock<AHashMap<VariantKind, VariantBuildStats>>,
    method_stats: RwLock<AHashMap<String, MethodBuildStats>>,
    counters: RwLock<BuildCounters>,
}

impl BuildProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished graph build
    pub fn record_graph(&self, method: &str, kind: VariantKind, duration: Duration, nodes: usize) {
        let duration_us = duration.as_micros() as u64;
        self.variant_stats
            .write()
            .entry(kind)
            .or_default()
            .record(duration_us, nodes);

        let mut methods = self.method_stats.write();
        let stats = methods
            .entry(method.to_string())
            .or_insert_with(|| MethodBuildStats {
                method: method.to_string(),
                ..Default::default()
            });
        match stats.nodes_per_variant.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => entry.1 = nodes,
            None => stats.nodes_per_variant.push((kind, nodes)),
        }
    }

    pub fn record_deopt_entry_points(&self, method: &str, count: usize) {
        self.method_entry(method, |stats| stats.deopt_entry_points = count);
    }

    pub fn record_encoded(&self, method: &str, bytes: usize) {
        self.method_entry(method, |stats| stats.encoded_bytes = bytes);
    }

    fn method_entry(&self, method: &str, f: impl FnOnce(&mut MethodBuildStats)) {
        let mut methods = self.method_stats.write();
        let stats = methods
            .entry(method.to_string())
            .or_insert_with(|| MethodBuildStats {
                method: method.to_string(),
                ..Default::default()
            });
        f(stats);
    }

    /// Update the whole-build counters
    pub fn update_counters(&self, f: impl FnOnce(&mut BuildCounters)) {
        f(&mut self.counters.write());
    }

    pub fn counters(&self) -> BuildCounters {
        self.counters.read().clone()
    }

    pub fn variant_stats(&self, kind: VariantKind) -> Option<VariantBuildStats> {
        self.variant_stats.read().get(&kind).cloned()
    }

    pub fn method_stats(&self, method: &str) -> Option<MethodBuildStats> {
        self.method_stats.read().get(method).cloned()
    }

    /// Per-method statistics sorted by method name
    pub fn all_method_stats(&self) -> Vec<MethodBuildStats> {
        let mut stats: Vec<_> = self.method_stats.read().values().cloned().collect();
        stats.sort_by(|a, b| a.method.cmp(&b.method));
        stats
    }

    /// Total time spent building graphs across all variant kinds
    pub fn total_build_time(&self) -> Duration {
        let total_us: u64 = self
            .variant_stats
            .read()
            .values()
            .map(|s| s.total_time_us)
            .sum();
        Duration::from_micros(total_us)
    }
}
