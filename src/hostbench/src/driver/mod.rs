//! Sequencing of the experiment phases on each host, and the result tables.
use std::collections::BTreeMap;
use std::convert::TryFrom;

use steering::{ConfigurationError, Flow, Side, SteeringConfig, Topology, TopologyMode};

use crate::experiment::{ExperimentKind, ProfileReport};
use crate::reduce::RpcStats;

pub mod receiver;
pub mod sender;

pub use receiver::ReceiverDriver;
pub use sender::Driver;

/// The traffic both hosts agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub mode: TopologyMode,
    /// Stream connections per side, `[1, max_connections]`
    pub connections: usize,
    /// Request/response connections, all on the first core
    pub rpcs: usize,
    /// Seconds of traffic per phase
    pub duration: u32,
    /// Socket window in KiB
    pub window_kib: Option<u32>,
    /// aRFS places the IRQs itself, so the `cpu + 1` cores are not profiled
    pub arfs: bool,
}

impl Workload {
    fn topology<'a>(&self, side: Side, cpus: &'a [usize], steering: &SteeringConfig) -> Topology<'a> {
        Topology {
            side,
            mode: self.mode,
            cpus,
            connections: self.connections,
            port_stride: steering.max_connections(),
        }
    }

    /// Application cores of this side: the first `connections` configured
    /// cores, or only the first when every connection converges on it.
    pub fn app_cpus(&self, side: Side, steering: &SteeringConfig) -> Vec<usize> {
        let take = if self.topology(side, &steering.cpus, steering).converges() {
            1
        } else {
            self.connections
        };
        steering.cpus.iter().take(take).copied().collect()
    }

    /// Cores covered by the profilers.
    pub fn profiled_cpus(&self, side: Side, steering: &SteeringConfig) -> Vec<usize> {
        let app = self.app_cpus(side, steering);
        if self.arfs {
            return app;
        }
        let irq = app.iter().map(|c| c + 1);
        app.iter().copied().chain(irq).collect()
    }

    /// Stream connections as (core, port).
    pub fn stream_flows(&self, side: Side, steering: &SteeringConfig) -> Result<Vec<Flow>, ConfigurationError> {
        let cpus = self.app_cpus(side, steering);
        self.topology(side, &cpus, steering).flows(steering.iperf_base_port)
    }

    /// Request/response connections, pinned to the first core.
    pub fn rpc_flows(&self, steering: &SteeringConfig) -> Result<Vec<Flow>, ConfigurationError> {
        if self.rpcs > steering.max_rpcs {
            return Err(ConfigurationError::TooManyRpcs {
                rpcs: self.rpcs,
                max: steering.max_rpcs,
            });
        }
        let cpu = *steering.cpus.first().ok_or(ConfigurationError::EmptyCpuSet)?;
        let base = steering.netperf_base_port;
        (0..self.rpcs)
            .map(|k| {
                let port = u16::try_from(base as usize + k)
                    .map_err(|_| ConfigurationError::PortOverflow { base, offset: k })?;
                Ok(Flow { cpu, port })
            })
            .collect()
    }
}

/// What one phase produced on one host.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub kind: ExperimentKind,
    /// Summed stream throughput; only the sender measures it
    pub throughput: Option<f64>,
    /// Mean request/response stats when rpc flows ran
    pub rpc: Option<RpcStats>,
    pub profile: Option<ProfileReport>,
    pub warnings: Vec<String>,
}

impl PhaseOutcome {
    fn metric(&self) -> f64 {
        match &self.profile {
            Some(ProfileReport::Utilisation(v)) | Some(ProfileReport::CacheMiss(v)) => *v,
            _ => 0.0,
        }
    }

    /// One line summary, in the `[kind] ...` style of the run log.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = self.throughput {
            parts.push(format!("total throughput: {:.3}", t));
        }
        match &self.profile {
            Some(ProfileReport::Utilisation(v)) => parts.push(format!("utilisation: {:.3}", v)),
            Some(ProfileReport::CacheMiss(v)) => parts.push(format!("cache miss: {:.3}", v)),
            Some(ProfileReport::Breakdown(b)) => {
                parts.push(format!("total contribution: {:.3}", b.total()));
                parts.push(format!("unaccounted contribution: {:.3}", b.unaccounted));
            }
            Some(ProfileReport::Flame(svg)) => parts.push(format!("flame graph: {}", svg.display())),
            None => {}
        }
        if let Some(rpc) = &self.rpc {
            parts.push(format!("rpc p50: {:.3} us\trpc p99: {:.3} us", rpc.p50_us, rpc.p99_us));
        }
        format!("[{}] {}", self.kind, parts.join("\t"))
    }
}

/// Accumulated summary row and breakdown tables of a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub header: Vec<String>,
    pub values: Vec<f64>,
    pub breakdowns: Vec<(ExperimentKind, BTreeMap<String, f64>)>,
}

impl ResultTable {
    fn cell(&mut self, name: String, value: f64) {
        self.header.push(name);
        self.values.push(value);
    }

    /// Append a phase. Failed metrics are kept as zero so columns stay aligned.
    pub fn push(&mut self, side: Side, outcome: &PhaseOutcome) {
        let kind = outcome.kind;
        match kind {
            ExperimentKind::Throughput => {
                if let (Some(col), Some(t)) = (kind.column(side), outcome.throughput) {
                    self.cell(col, t);
                }
            }
            ExperimentKind::Utilisation | ExperimentKind::CacheMiss => {
                if let Some(col) = kind.column(side) {
                    self.cell(col, outcome.metric());
                }
            }
            ExperimentKind::UtilBreakdown | ExperimentKind::CacheBreakdown => {
                let contributions = match &outcome.profile {
                    Some(ProfileReport::Breakdown(b)) => b.contributions.clone(),
                    _ => BTreeMap::new(),
                };
                self.breakdowns.push((kind, contributions));
            }
            ExperimentKind::Latency => {
                if let Some(rpc) = &outcome.rpc {
                    self.cell("rpc p50 latency (us)".to_owned(), rpc.p50_us);
                    self.cell("rpc p99 latency (us)".to_owned(), rpc.p99_us);
                }
            }
            ExperimentKind::Flame => {}
        }
    }

    /// Tab separated: the summary row, then each breakdown sorted by category.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let row = |values: &mut dyn Iterator<Item = f64>| {
            values.map(|v| format!("{:.3}", v)).collect::<Vec<_>>().join("\t")
        };
        if !self.header.is_empty() {
            out.push_str(&self.header.join("\t"));
            out.push('\n');
            out.push_str(&row(&mut self.values.iter().copied()));
            out.push('\n');
        }
        for (_, contributions) in &self.breakdowns {
            let keys: Vec<&str> = contributions.keys().map(String::as_str).collect();
            out.push_str(&keys.join("\t"));
            out.push('\n');
            out.push_str(&row(&mut contributions.values().copied()));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::Breakdown;

    fn workload(mode: TopologyMode, connections: usize) -> Workload {
        Workload {
            mode,
            connections,
            rpcs: 0,
            duration: 10,
            window_kib: None,
            arfs: false,
        }
    }

    #[test]
    fn sender_and_receiver_agree_on_ports() {
        let steering = SteeringConfig::default();
        for &mode in &[
            TopologyMode::OneToOne,
            TopologyMode::Incast,
            TopologyMode::Outcast,
            TopologyMode::AllToAll,
        ] {
            let w = workload(mode, 3);
            let ports = |side| {
                let mut p: Vec<u16> = w.stream_flows(side, &steering).unwrap().iter().map(|f| f.port).collect();
                p.sort_unstable();
                p
            };
            assert_eq!(ports(Side::Sender), ports(Side::Receiver), "{}", mode);
        }
    }

    #[test]
    fn converging_side_uses_first_core() {
        let steering = SteeringConfig::default();
        let w = workload(TopologyMode::Outcast, 3);
        assert_eq!(w.app_cpus(Side::Sender, &steering), vec![0]);
        assert_eq!(w.app_cpus(Side::Receiver, &steering), vec![0, 2, 4]);
        let flows = w.stream_flows(Side::Sender, &steering).unwrap();
        assert_eq!(flows.len(), 3);
        assert!(flows.iter().all(|f| f.cpu == 0));
    }

    #[test]
    fn all_to_all_uses_configured_stride() {
        let steering = SteeringConfig::default();
        let flows = workload(TopologyMode::AllToAll, 2).stream_flows(Side::Sender, &steering).unwrap();
        let ports: Vec<u16> = flows.iter().map(|f| f.port).collect();
        assert_eq!(ports, vec![30000, 30001, 30011, 30012]);
    }

    #[test]
    fn profiled_cores_include_irq_siblings() {
        let steering = SteeringConfig::default();
        let mut w = workload(TopologyMode::OneToOne, 2);
        assert_eq!(w.profiled_cpus(Side::Sender, &steering), vec![0, 2, 1, 3]);
        w.arfs = true;
        assert_eq!(w.profiled_cpus(Side::Sender, &steering), vec![0, 2]);
    }

    #[test]
    fn rpc_flows_checked() {
        let steering = SteeringConfig::default();
        let mut w = workload(TopologyMode::OneToOne, 1);
        w.rpcs = 2;
        let flows = w.rpc_flows(&steering).unwrap();
        assert_eq!(flows, vec![Flow { cpu: 0, port: 40000 }, Flow { cpu: 0, port: 40001 }]);
        w.rpcs = 17;
        assert!(matches!(
            w.rpc_flows(&steering),
            Err(ConfigurationError::TooManyRpcs { rpcs: 17, max: 16 })
        ));
    }

    #[test]
    fn table_keeps_degraded_values() {
        let mut table = ResultTable::default();
        let outcome = |kind, throughput, profile| PhaseOutcome {
            kind,
            throughput,
            rpc: None,
            profile,
            warnings: Vec::new(),
        };
        table.push(Side::Sender, &outcome(ExperimentKind::Throughput, Some(3.5), None));
        // sar failed to parse
        table.push(Side::Sender, &outcome(ExperimentKind::Utilisation, Some(3.4), None));
        let mut breakdown = Breakdown::default();
        breakdown.contributions.insert("tcp/ip".to_owned(), 30.0);
        breakdown.contributions.insert("data copy".to_owned(), 60.0);
        table.push(
            Side::Sender,
            &outcome(ExperimentKind::UtilBreakdown, Some(3.3), Some(ProfileReport::Breakdown(breakdown))),
        );
        assert_eq!(
            table.render(),
            "throughput (Gbps)\tsender utilisation (%)\n3.500\t0.000\ndata copy\ttcp/ip\n60.000\t30.000\n"
        );
    }
}
