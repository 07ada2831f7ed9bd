pub mod build_profiler;

pub use build_profiler::{BuildCounters, BuildProfiler, MethodBuildStats, VariantBuildStats};
