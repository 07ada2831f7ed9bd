//! Wall-clock timings of the stages of a deferred-compilation build.

use std::fmt;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

/// The stages of a build, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildPhase {
    /// Call-tree passes alternating with the reachability analysis.
    CallTree,
    DeoptEntries,
    /// Removal of call sites the analysis proved unreachable.
    Prune,
    DeoptTargets,
    Encode,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 5] = [
        BuildPhase::CallTree,
        BuildPhase::DeoptEntries,
        BuildPhase::Prune,
        BuildPhase::DeoptTargets,
        BuildPhase::Encode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuildPhase::CallTree => "call-tree",
            BuildPhase::DeoptEntries => "deopt-entries",
            BuildPhase::Prune => "prune",
            BuildPhase::DeoptTargets => "deopt-targets",
            BuildPhase::Encode => "encode",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Started on creation; used for per-pass and per-graph log fields.
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start_new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_us(&self) -> u64 {
        u64::try_from(self.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    pub phase: BuildPhase,
    #[serde(rename = "elapsed_us", serialize_with = "as_micros")]
    pub duration: Duration,
}

fn as_micros<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}

/// Timings of one build. A phase that runs more than once accumulates.
#[derive(Debug, Clone, Default)]
pub struct PhaseTimings {
    phases: Vec<PhaseTiming>,
}

impl PhaseTimings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` and charge its wall-clock time to `phase`.
    pub fn time<F, T>(&mut self, phase: BuildPhase, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let stopwatch = Stopwatch::start_new();
        let output = f();
        let duration = stopwatch.elapsed();
        debug!(%phase, elapsed_us = stopwatch.elapsed_us(), "build phase finished");
        self.add(phase, duration);
        output
    }

    pub fn add(&mut self, phase: BuildPhase, duration: Duration) {
        match self.phases.iter_mut().find(|timing| timing.phase == phase) {
            Some(timing) => timing.duration += duration,
            None => self.phases.push(PhaseTiming { phase, duration }),
        }
    }

    /// Phases in the order they first ran.
    pub fn phases(&self) -> &[PhaseTiming] {
        &self.phases
    }

    pub fn duration_of(&self, phase: BuildPhase) -> Option<Duration> {
        self.phases
            .iter()
            .find(|timing| timing.phase == phase)
            .map(|timing| timing.duration)
    }

    pub fn total(&self) -> Duration {
        self.phases.iter().map(|timing| timing.duration).sum()
    }

    pub fn slowest(&self) -> Option<PhaseTiming> {
        self.phases.iter().copied().max_by_key(|timing| timing.duration)
    }

    /// One line per phase with its share of the total.
    pub fn render(&self) -> String {
        let total = self.total().as_secs_f64();
        let mut out = String::new();
        for timing in &self.phases {
            let share = if total > 0.0 {
                timing.duration.as_secs_f64() / total * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "{:<14} {:>10.3}ms {:>5.1}%",
                timing.phase.name(),
                timing.duration.as_secs_f64() * 1000.0,
                share
            );
        }
        out
    }
}
