use std::path::PathBuf;

use steering::TopologyMode;
use structopt::StructOpt;

use crate::config::BenchConfig;
use crate::driver::Workload;
use crate::ExperimentKind;

/// Which phases to run; they always run in the order listed here.
#[derive(Debug, Clone, Default, StructOpt)]
pub struct ExperimentFlags {
    /// Measure throughput in Gbps
    #[structopt(long)]
    pub throughput: bool,
    /// Measure CPU utilisation in percent
    #[structopt(long)]
    pub utilisation: bool,
    /// Measure LLC miss rate in percent
    #[structopt(long)]
    pub cache_miss: bool,
    /// Calculate CPU utilisation breakdown
    #[structopt(long)]
    pub util_breakdown: bool,
    /// Calculate cache miss breakdown
    #[structopt(long)]
    pub cache_breakdown: bool,
    /// Create a flame graph from the experiment
    #[structopt(long)]
    pub flame: bool,
    /// Measure request/response latency
    #[structopt(long)]
    pub latency: bool,
}

impl ExperimentFlags {
    pub fn kinds(&self) -> Vec<ExperimentKind> {
        let enabled = [
            self.throughput,
            self.utilisation,
            self.cache_miss,
            self.util_breakdown,
            self.cache_breakdown,
            self.flame,
            self.latency,
        ];
        ExperimentKind::ALL
            .iter()
            .zip(enabled.iter())
            .filter(|(_, on)| **on)
            .map(|(&k, _)| k)
            .collect()
    }
}

/// Options both hosts must agree on.
#[derive(Debug, Clone, StructOpt)]
pub struct WorkloadArgs {
    /// Topology to run the experiment with
    #[structopt(long, default_value = "one-to-one")]
    pub topology: TopologyMode,

    /// Number of stream connections
    #[structopt(long, default_value = "1")]
    pub num_connections: usize,

    /// Number of request/response connections
    #[structopt(long, default_value = "0")]
    pub num_rpcs: usize,

    /// This experiment is run with aRFS
    #[structopt(long)]
    pub arfs: bool,

    /// Duration of each phase in seconds
    #[structopt(long, default_value = "20")]
    pub duration: u32,

    /// TCP window size in KiB
    #[structopt(long)]
    pub window: Option<u32>,

    /// Write raw output to the directory
    #[structopt(long, parse(from_os_str))]
    pub output: Option<PathBuf>,

    /// Testbed settings (cpus, ports, tools, symbols) in toml
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config: Option<PathBuf>,

    #[structopt(flatten)]
    pub experiments: ExperimentFlags,
}

impl WorkloadArgs {
    pub fn validate(&self, config: &BenchConfig) -> anyhow::Result<()> {
        let max_connections = config.steering.max_connections();
        let max_rpcs = config.steering.max_rpcs;
        anyhow::ensure!(
            (1..=max_connections).contains(&self.num_connections),
            "Can't set --num-connections outside of [1, {}].",
            max_connections
        );
        anyhow::ensure!(
            self.num_rpcs <= max_rpcs,
            "Can't set --num-rpcs outside of [0, {}].",
            max_rpcs
        );
        anyhow::ensure!(
            self.num_rpcs == 0 || self.num_connections == 1,
            "Can't use more than 1 --num-connections if using --num-rpcs."
        );
        anyhow::ensure!(
            (5..=60).contains(&self.duration),
            "Can't set --duration outside of [5, 60]."
        );
        anyhow::ensure!(
            !self.experiments.flame || self.output.is_some(),
            "Please provide --output if using --flame."
        );
        Ok(())
    }

    pub fn workload(&self) -> Workload {
        Workload {
            mode: self.topology,
            connections: self.num_connections,
            rpcs: self.num_rpcs,
            duration: self.duration,
            window_kib: self.window,
            arfs: self.arfs,
        }
    }
}

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "sender", about = "Run TCP measurement experiments on the sender.")]
pub struct SenderOpts {
    /// Address of the receiver to synchronize with
    #[structopt(long)]
    pub receiver: String,

    /// Address of the receiver on the experiment network
    #[structopt(long)]
    pub addr: String,

    #[structopt(flatten)]
    pub args: WorkloadArgs,
}

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "receiver", about = "Serve TCP measurement experiments on the receiver.")]
pub struct ReceiverOpts {
    /// Address to accept the sender's synchronization on
    #[structopt(long, default_value = "0.0.0.0")]
    pub bind: String,

    #[structopt(flatten)]
    pub args: WorkloadArgs,
}
