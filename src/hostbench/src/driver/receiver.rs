use std::path::PathBuf;

use steering::Side;

use super::{PhaseOutcome, ResultTable, Workload};
use crate::config::BenchConfig;
use crate::experiment::{ActiveProfiler, ExperimentKind, ExperimentRun};
use crate::process::{Launcher, ProcHandle};
use crate::sync::ReceiverBarrier;
use crate::tools;

/// Mirrors the sender's phases: the listeners stay up for the whole run and
/// each phase's profiler covers the window between ready and done.
pub struct ReceiverDriver<L> {
    launcher: L,
    barrier: ReceiverBarrier,
    config: BenchConfig,
    workload: Workload,
    output: Option<PathBuf>,
    listeners: Vec<ProcHandle>,
    table: ResultTable,
}

impl<L: Launcher> ReceiverDriver<L> {
    pub fn new(
        launcher: L,
        barrier: ReceiverBarrier,
        config: BenchConfig,
        workload: Workload,
        output: Option<PathBuf>,
    ) -> Self {
        ReceiverDriver {
            launcher,
            barrier,
            config,
            workload,
            output,
            listeners: Vec::new(),
            table: ResultTable::default(),
        }
    }

    /// One iperf server per stream connection, one netserver per rpc.
    pub fn start_listeners(&mut self) -> crate::Result<()> {
        let steering = &self.config.steering;
        let paths = &self.config.tools;
        for flow in self.workload.stream_flows(Side::Receiver, steering)? {
            let inv = tools::iperf_server(paths, flow.cpu, flow.port, self.workload.window_kib);
            self.listeners.push(self.launcher.start(&inv)?);
        }
        for flow in self.workload.rpc_flows(steering)? {
            let inv = tools::netserver(paths, flow.cpu, flow.port);
            self.listeners.push(self.launcher.start(&inv)?);
        }
        log::info!("{} listeners started", self.listeners.len());
        Ok(())
    }

    pub fn run(&mut self, kinds: &[ExperimentKind]) -> crate::Result<&ResultTable> {
        for &kind in kinds {
            let outcome = self.run_phase(kind)?;
            self.table.push(Side::Receiver, &outcome);
        }
        // closing round trip of the sender
        self.barrier.wait_sender_ready();
        self.barrier.mark_receiver_ready()?;
        self.barrier.wait_sender_done();
        Ok(&self.table)
    }

    pub fn run_phase(&mut self, kind: ExperimentKind) -> crate::Result<PhaseOutcome> {
        let mut run = ExperimentRun::new(kind);
        let phase = self.barrier.wait_sender_ready();
        log::debug!("[{}] sender ready for phase {}", kind, phase);

        let profiler = match kind.profiler() {
            Some(p) => {
                let cpus = self.workload.profiled_cpus(Side::Receiver, &self.config.steering);
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
        if let Err(e) = self.barrier.mark_receiver_ready() {
            if let Some(active) = &profiler {
                if let Err(e) = active.stop(&mut self.launcher) {
                    log::warn!("[{}] failed to stop profiler: {}", kind, e);
                }
            }
            return Err(e.into());
        }
        run.advance();
        log::info!("[{}] starting experiment...", kind);

        self.barrier.wait_sender_done();
        run.advance();
        if let Some(active) = &profiler {
            if let Err(e) = active.stop(&mut self.launcher) {
                run.warn(format!("failed to stop profiler: {}", e));
            }
        }
        log::info!(
            "[{}] finished experiment in {:?}.",
            kind,
            run.elapsed().unwrap_or_default()
        );

        run.advance();
        let output = self.output.as_deref();
        let config = &self.config;
        let launcher = &mut self.launcher;
        let profile = match profiler.map(|a| a.reduce(launcher, config, output, kind.log_prefix())) {
            Some(Ok(report)) => Some(report),
            Some(Err(e)) => {
                run.warn(format!("profile: {}", e));
                None
            }
            None => None,
        };
        run.advance();

        let outcome = PhaseOutcome {
            kind,
            throughput: None,
            rpc: None,
            profile,
            warnings: std::mem::take(&mut run.warnings),
        };
        log::info!("{}", outcome.summary());
        Ok(outcome)
    }

    /// Stop the listeners.
    pub fn shutdown(&mut self) {
        for &h in &self.listeners {
            if let Err(e) = self.launcher.interrupt(h) {
                log::warn!("{}", e);
            }
        }
        for h in self.listeners.drain(..) {
            if let Err(e) = self.launcher.wait(h) {
                log::warn!("{}", e);
            }
        }
    }

    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    pub fn into_launcher(self) -> L {
        self.launcher
    }
}
