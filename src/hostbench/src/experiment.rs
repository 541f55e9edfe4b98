//! Experiment kinds, their profilers, and the lifecycle of one run.
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use steering::Side;

use crate::config::BenchConfig;
use crate::process::{run_to_end, Exit, Invocation, Launcher, ProcHandle};
use crate::reduce::{self, Breakdown};
use crate::tools::{self, RecordMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentKind {
    Throughput,
    Utilisation,
    CacheMiss,
    UtilBreakdown,
    CacheBreakdown,
    Flame,
    Latency,
}

impl ExperimentKind {
    /// Every kind, in the order the phases run.
    pub const ALL: [ExperimentKind; 7] = [
        ExperimentKind::Throughput,
        ExperimentKind::Utilisation,
        ExperimentKind::CacheMiss,
        ExperimentKind::UtilBreakdown,
        ExperimentKind::CacheBreakdown,
        ExperimentKind::Flame,
        ExperimentKind::Latency,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Throughput => "throughput",
            Self::Utilisation => "utilisation",
            Self::CacheMiss => "cache miss",
            Self::UtilBreakdown => "util breakdown",
            Self::CacheBreakdown => "cache breakdown",
            Self::Flame => "flame",
            Self::Latency => "latency",
        }
    }

    /// File name prefix of the raw logs.
    pub fn log_prefix(&self) -> &'static str {
        match self {
            Self::Throughput => "throughput",
            Self::Utilisation => "utilisation",
            Self::CacheMiss => "cache-miss",
            Self::UtilBreakdown => "util-breakdown",
            Self::CacheBreakdown => "cache-breakdown",
            Self::Flame => "flame",
            Self::Latency => "latency",
        }
    }

    pub fn profiler(&self) -> Option<Profiler> {
        match self {
            Self::Throughput | Self::Latency => None,
            Self::Utilisation => Some(Profiler::Sar),
            Self::CacheMiss => Some(Profiler::PerfStat),
            Self::UtilBreakdown => Some(Profiler::PerfRecord(RecordMode::Cycles)),
            Self::CacheBreakdown => Some(Profiler::PerfRecord(RecordMode::CacheMisses)),
            Self::Flame => Some(Profiler::PerfRecord(RecordMode::CallGraph)),
        }
    }

    /// Whether the profile is reduced through `perf report`.
    pub fn needs_report(&self) -> bool {
        matches!(self, Self::UtilBreakdown | Self::CacheBreakdown)
    }

    /// Summary column of the single metric this kind contributes.
    pub fn column(&self, side: Side) -> Option<String> {
        match self {
            Self::Throughput => Some("throughput (Gbps)".to_owned()),
            Self::Utilisation => Some(format!("{} utilisation (%)", side)),
            Self::CacheMiss => Some(format!("{} cache miss (%)", side)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profiler {
    Sar,
    PerfStat,
    PerfRecord(RecordMode),
}

impl Profiler {
    /// Tool name used in raw log file names.
    pub fn tool(&self) -> &'static str {
        match self {
            Profiler::Sar => "sar",
            Profiler::PerfStat | Profiler::PerfRecord(_) => "perf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    AwaitingPeer,
    Running,
    Stopping,
    Reducing,
    Complete,
}

/// One barrier-synchronized window.
#[derive(Debug)]
pub struct ExperimentRun {
    pub kind: ExperimentKind,
    pub state: RunState,
    pub generators: Vec<ProcHandle>,
    pub started: Option<Instant>,
    pub stopped: Option<Instant>,
    pub warnings: Vec<String>,
}

impl ExperimentRun {
    pub fn new(kind: ExperimentKind) -> Self {
        ExperimentRun {
            kind,
            state: RunState::AwaitingPeer,
            generators: Vec::new(),
            started: None,
            stopped: None,
            warnings: Vec::new(),
        }
    }

    /// Move to the next state, stamping the traffic window.
    pub fn advance(&mut self) -> RunState {
        self.state = match self.state {
            RunState::AwaitingPeer => {
                self.started = Some(Instant::now());
                RunState::Running
            }
            RunState::Running => {
                self.stopped = Some(Instant::now());
                RunState::Stopping
            }
            RunState::Stopping => RunState::Reducing,
            RunState::Reducing | RunState::Complete => RunState::Complete,
        };
        self.state
    }

    pub fn warn<S: Into<String>>(&mut self, msg: S) {
        let msg = msg.into();
        log::warn!("[{}] {}", self.kind, msg);
        self.warnings.push(msg);
    }

    /// Duration of the traffic window, once it closed.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        Some(self.stopped?.duration_since(self.started?))
    }
}

/// What a profiler measured.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileReport {
    Utilisation(f64),
    CacheMiss(f64),
    Breakdown(Breakdown),
    Flame(PathBuf),
}

/// A profiler started for one phase. `perf record` data lives in a scratch
/// directory that goes away with this value.
pub struct ActiveProfiler {
    profiler: Profiler,
    handle: ProcHandle,
    scratch: Option<tempfile::TempDir>,
}

impl ActiveProfiler {
    pub fn start<L: Launcher + ?Sized>(
        launcher: &mut L,
        profiler: Profiler,
        config: &BenchConfig,
        cpus: &[usize],
    ) -> crate::Result<Self> {
        let paths = &config.tools;
        let (inv, scratch) = match profiler {
            Profiler::Sar => (tools::sar(paths, cpus), None),
            Profiler::PerfStat => (tools::perf_stat_cache(paths, cpus), None),
            Profiler::PerfRecord(mode) => {
                let scratch = tempfile::tempdir()?;
                let data = scratch.path().join(PERF_DATA);
                (tools::perf_record(paths, cpus, mode, &data), Some(scratch))
            }
        };
        let handle = launcher.start(&inv)?;
        Ok(ActiveProfiler {
            profiler,
            handle,
            scratch,
        })
    }

    #[inline]
    pub fn handle(&self) -> ProcHandle {
        self.handle
    }

    fn data(&self) -> Option<PathBuf> {
        self.scratch.as_ref().map(|d| d.path().join(PERF_DATA))
    }

    /// SIGINT, then reap.
    pub fn stop<L: Launcher + ?Sized>(&self, launcher: &mut L) -> crate::Result<Exit> {
        launcher.interrupt(self.handle)?;
        Ok(launcher.wait(self.handle)?)
    }

    /// Turn the profiler output into a metric and save the raw text it came from.
    pub fn reduce<L: Launcher + ?Sized>(
        self,
        launcher: &mut L,
        config: &BenchConfig,
        output: Option<&Path>,
        prefix: &str,
    ) -> Result<ProfileReport, String> {
        let raw_name = format!("{}_{}.log", prefix, self.profiler.tool());
        let lines = launcher.collect_output(self.handle);
        match self.profiler {
            Profiler::Sar => {
                utils::fs::save_raw_log(output, &raw_name, &lines);
                let per_core = reduce::parse_sar(&lines).map_err(|e| e.to_string())?;
                Ok(ProfileReport::Utilisation(reduce::total_utilisation(&per_core)))
            }
            Profiler::PerfStat => {
                utils::fs::save_raw_log(output, &raw_name, &lines);
                let stats = reduce::parse_perf_stat(&lines).map_err(|e| e.to_string())?;
                Ok(ProfileReport::CacheMiss(stats.miss_ratio()))
            }
            Profiler::PerfRecord(RecordMode::CallGraph) => {
                let data = self.data().ok_or("perf record without a data file")?;
                let dir = output.ok_or("flame graphs need an output directory")?;
                let svg = dir.join("flame.svg");
                let folded = dir.join("flame.folded");
                let inv = tools::flamegraph(&config.tools, &data, &folded, &svg);
                run_checked(launcher, &inv)?;
                Ok(ProfileReport::Flame(svg))
            }
            Profiler::PerfRecord(_) => {
                let data = self.data().ok_or("perf record without a data file")?;
                let report = run_checked(launcher, &tools::perf_report(&config.tools, &data))?;
                utils::fs::save_raw_log(output, &raw_name, &report);
                let breakdown =
                    reduce::parse_perf_report(&report, config.symbols(), config.min_percent).map_err(|e| e.to_string())?;
                Ok(ProfileReport::Breakdown(breakdown))
            }
        }
    }
}

const PERF_DATA: &str = "perf.data";

fn run_checked<L: Launcher + ?Sized>(launcher: &mut L, inv: &Invocation) -> Result<Vec<String>, String> {
    let (exit, lines) = run_to_end(launcher, inv).map_err(|e| e.to_string())?;
    if !exit.success() {
        return Err(format!("`{}` {}", inv, exit));
    }
    Ok(lines)
}
