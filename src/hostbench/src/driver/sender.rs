use std::path::PathBuf;

use steering::{Flow, Side};

use super::{PhaseOutcome, ResultTable, Workload};
use crate::config::BenchConfig;
use crate::experiment::{ActiveProfiler, ExperimentKind, ExperimentRun, ProfileReport};
use crate::process::{run_to_end, wait_all, Launcher, ProcHandle};
use crate::reduce::{self, RpcStats};
use crate::sync::{SenderBarrier, SyncError};
use crate::tools;

/// Drives the experiment phases on the sender.
///
/// Per phase: rendezvous with the receiver, start every generator, start the
/// profiler, wait every generator, mark done, stop the profiler, reduce.
pub struct Driver<L, B> {
    launcher: L,
    barrier: B,
    config: BenchConfig,
    workload: Workload,
    /// Receiver address on the experiment network
    target: String,
    output: Option<PathBuf>,
    table: ResultTable,
    stream_flows: Vec<Flow>,
    rpc_flows: Vec<Flow>,
    /// A done mark that failed mid-phase, raised once the phase is reduced
    barrier_error: Option<SyncError>,
}

struct Generators {
    iperf: Vec<ProcHandle>,
    netperf: Vec<ProcHandle>,
}

impl Generators {
    fn all(&self) -> Vec<ProcHandle> {
        self.iperf.iter().chain(&self.netperf).copied().collect()
    }
}

impl<L: Launcher, B: SenderBarrier> Driver<L, B> {
    /// Flows are derived up front, a bad workload fails before any traffic.
    pub fn new(
        launcher: L,
        barrier: B,
        config: BenchConfig,
        workload: Workload,
        target: &str,
        output: Option<PathBuf>,
    ) -> crate::Result<Self> {
        let stream_flows = workload.stream_flows(Side::Sender, &config.steering)?;
        let rpc_flows = workload.rpc_flows(&config.steering)?;
        Ok(Driver {
            launcher,
            barrier,
            config,
            workload,
            target: target.to_owned(),
            output,
            table: ResultTable::default(),
            stream_flows,
            rpc_flows,
            barrier_error: None,
        })
    }

    /// Kill generators and profilers left over by an earlier run.
    pub fn clear_stale(&mut self) {
        for name in &["iperf", "netperf", "perf", "sar"] {
            match run_to_end(&mut self.launcher, &tools::pkill(name)) {
                Ok((exit, _)) => log::debug!("pkill {}: {}", name, exit),
                Err(e) => log::warn!("pkill {}: {}", name, e),
            }
        }
    }

    /// Run every kind in order, then the closing round trip.
    ///
    /// A barrier failure stops the run, but phases completed so far stay in
    /// [`Driver::table`].
    pub fn run(&mut self, kinds: &[ExperimentKind]) -> crate::Result<&ResultTable> {
        for &kind in kinds {
            let outcome = self.run_phase(kind)?;
            self.table.push(Side::Sender, &outcome);
            if let Some(e) = self.barrier_error.take() {
                log::warn!("[{}] barrier lost, skipping remaining phases", kind);
                return Err(e.into());
            }
        }
        self.finish()?;
        Ok(&self.table)
    }

    fn rendezvous(&mut self) -> crate::Result<()> {
        self.barrier.mark_sender_ready()?;
        if !self.barrier.is_receiver_ready()? {
            log::warn!("receiver answered not ready, starting anyway");
        }
        Ok(())
    }

    fn start_generators(&mut self, run: &mut ExperimentRun) -> Generators {
        let w = &self.workload;
        let paths = &self.config.tools;
        let mut gens = Generators {
            iperf: Vec::new(),
            netperf: Vec::new(),
        };
        for flow in &self.stream_flows {
            let inv = tools::iperf_client(paths, flow.cpu, &self.target, flow.port, w.duration, w.window_kib);
            match self.launcher.start(&inv) {
                Ok(h) => gens.iperf.push(h),
                Err(e) => run.warn(e.to_string()),
            }
        }
        for flow in &self.rpc_flows {
            let inv = tools::netperf(paths, flow.cpu, &self.target, flow.port, w.duration);
            match self.launcher.start(&inv) {
                Ok(h) => gens.netperf.push(h),
                Err(e) => run.warn(e.to_string()),
            }
        }
        gens
    }

    /// One barrier-synchronized phase.
    pub fn run_phase(&mut self, kind: ExperimentKind) -> crate::Result<PhaseOutcome> {
        let mut run = ExperimentRun::new(kind);
        self.rendezvous()?;
        log::info!("[{}] starting experiment...", kind);
        run.advance();

        let gens = self.start_generators(&mut run);
        run.generators = gens.all();

        let profiler = match kind.profiler() {
            Some(p) => {
                let cpus = self.workload.profiled_cpus(Side::Sender, &self.config.steering);
                match ActiveProfiler::start(&mut self.launcher, p, &self.config, &cpus) {
                    Ok(active) => Some(active),
                    Err(e) => {
                        run.warn(format!("profiler did not start: {}", e));
                        None
                    }
                }
            }
            None => None,
        };

        // every generator is reaped, failed or not, before the profiler stops
        for (h, result) in run.generators.clone().into_iter().zip(wait_all(&mut self.launcher, &run.generators)) {
            match result {
                Ok(exit) if !exit.success() => run.warn(format!("generator {:?} {}", h, exit)),
                Ok(_) => {}
                Err(e) => run.warn(e.to_string()),
            }
        }
        // the profiler is stopped and reaped even when the receiver is gone
        if let Err(e) = self.barrier.mark_sender_done() {
            run.warn(format!("failed to mark done: {}", e));
            self.barrier_error = Some(e);
        }

        run.advance();
        if let Some(active) = &profiler {
            match active.stop(&mut self.launcher) {
                Ok(exit) => log::debug!("[{}] profiler {}", kind, exit),
                Err(e) => run.warn(format!("failed to stop profiler: {}", e)),
            }
        }
        log::info!(
            "[{}] finished experiment in {:?}.",
            kind,
            run.elapsed().unwrap_or_default()
        );

        run.advance();
        let outcome = self.reduce(&mut run, &gens, profiler);
        run.advance();
        log::info!("{}", outcome.summary());
        Ok(outcome)
    }

    fn reduce(&mut self, run: &mut ExperimentRun, gens: &Generators, profiler: Option<ActiveProfiler>) -> PhaseOutcome {
        let kind = run.kind;
        let prefix = kind.log_prefix();
        let output = self.output.as_deref();
        let config = &self.config;
        let launcher = &mut self.launcher;

        let mut iperf_lines = Vec::with_capacity(gens.iperf.len());
        for (i, &h) in gens.iperf.iter().enumerate() {
            let lines = launcher.collect_output(h);
            utils::fs::save_raw_log(output, &format!("{}_iperf_{}.log", prefix, i), &lines);
            iperf_lines.push(lines);
        }
        let sum = reduce::sum_throughput(&iperf_lines);
        for (i, e) in sum.errors {
            run.warnings.push(format!("iperf instance {}: {}", i, e));
        }

        let mut rpc_stats = Vec::new();
        for (i, &h) in gens.netperf.iter().enumerate() {
            let lines = launcher.collect_output(h);
            utils::fs::save_raw_log(output, &format!("{}_netperf_{}.log", prefix, i), &lines);
            match reduce::parse_netperf(&lines) {
                Ok(stats) => rpc_stats.push(stats),
                Err(e) => run.warn(format!("netperf instance {}: {}", i, e)),
            }
        }
        let rpc = if self.rpc_flows.is_empty() {
            None
        } else {
            Some(RpcStats::mean(&rpc_stats).unwrap_or_default())
        };

        let profile = match profiler.map(|active| active.reduce(launcher, config, output, prefix)) {
            Some(Ok(report)) => Some(report),
            Some(Err(e)) => {
                run.warn(format!("profile: {}", e));
                None
            }
            None => None,
        };
        if let Some(ProfileReport::Breakdown(b)) = &profile {
            if b.needs_attention() {
                run.warn(format!("unknown symbols: {}", b.not_found.join(", ")));
            }
        }

        PhaseOutcome {
            kind,
            throughput: Some(sum.total),
            rpc,
            profile,
            warnings: std::mem::take(&mut run.warnings),
        }
    }

    /// A last ready/confirm/done round trip with no traffic, so neither host
    /// exits while the other still waits.
    fn finish(&mut self) -> crate::Result<()> {
        self.rendezvous()?;
        self.barrier.mark_sender_done()?;
        Ok(())
    }

    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    pub fn into_parts(self) -> (L, B) {
        (self.launcher, self.barrier)
    }
}
