pub mod logger;
pub mod phases;

pub use phases::{BuildPhase, PhaseTiming, PhaseTimings, Stopwatch};
