use crate::queue::{queue_for, OutOfRange};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyMode {
    OneToOne,
    Incast,
    Outcast,
    AllToAll,
}

impl std::fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OneToOne => "one-to-one",
            Self::Incast => "incast",
            Self::Outcast => "outcast",
            Self::AllToAll => "all-to-all",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TopologyMode {
    type Err = ConfigurationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one-to-one" => Ok(Self::OneToOne),
            "incast" => Ok(Self::Incast),
            "outcast" => Ok(Self::Outcast),
            "all-to-all" => Ok(Self::AllToAll),
            _ => Err(ConfigurationError::UnknownMode(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    Sender,
    Receiver,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sender => write!(f, "sender"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("unknown topology mode: {0}")]
    UnknownMode(String),
    #[error("empty cpu set")]
    EmptyCpuSet,
    #[error("cpu {0} appears more than once in the cpu set")]
    DuplicateCpu(usize),
    #[error("{cpus} cpus exceed the maximum of {max} connections")]
    TooManyCpus { cpus: usize, max: usize },
    #[error("{flows} flows exceed the {max} connection slots of the rule table")]
    TooManyFlows { flows: usize, max: usize },
    #[error("{rpcs} rpc flows exceed the maximum of {max}")]
    TooManyRpcs { rpcs: usize, max: usize },
    #[error("rule slot {slot} does not fit a table of {size} rules")]
    TableOverflow { slot: usize, size: usize },
    #[error("port {base} + {offset} is not a valid port")]
    PortOverflow { base: u16, offset: usize },
    #[error("no rx queue for irq core: {0}")]
    NoQueue(#[from] OutOfRange),
}

/// Size of the hardware rule table we are allowed to use.
///
/// The table is split in two halves of `N^2 + R` slots: destination-port
/// rules live in the first half, their source-port mirrors in the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub max_connections: usize,
    pub max_rpcs: usize,
}

impl Capacity {
    pub fn new(max_connections: usize, max_rpcs: usize) -> Self {
        Capacity {
            max_connections,
            max_rpcs,
        }
    }

    /// Slots reserved for stream connections, the all-to-all worst case.
    #[inline]
    pub fn max_flows(&self) -> usize {
        self.max_connections * self.max_connections
    }

    #[inline]
    pub fn half(&self) -> usize {
        self.max_flows() + self.max_rpcs
    }

    #[inline]
    pub fn table_size(&self) -> usize {
        2 * self.half()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchField {
    SrcPort,
    DstPort,
}

impl std::fmt::Display for MatchField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SrcPort => write!(f, "src-port"),
            Self::DstPort => write!(f, "dst-port"),
        }
    }
}

/// `flow-type` of an ntuple rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp4,
    Udp4,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp4 => write!(f, "tcp4"),
            Self::Udp4 => write!(f, "udp4"),
        }
    }
}

/// One ntuple steering rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub transport: Transport,
    pub field: MatchField,
    pub port: u16,
    pub queue: usize,
    pub slot: usize,
}

impl Rule {
    /// The two rules steering both directions of the connection on `port`.
    fn pair(transport: Transport, port: u16, queue: usize, slot: usize, half: usize) -> [Rule; 2] {
        [
            Rule {
                transport,
                field: MatchField::DstPort,
                port,
                queue,
                slot,
            },
            Rule {
                transport,
                field: MatchField::SrcPort,
                port,
                queue,
                slot: slot + half,
            },
        ]
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "flow-type {} {} {} action {} loc {}",
            self.transport, self.field, self.port, self.queue, self.slot
        )
    }
}

/// A logical connection pinned to `cpu`, identified by its server port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    pub cpu: usize,
    pub port: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct Topology<'a> {
    pub side: Side,
    pub mode: TopologyMode,
    pub cpus: &'a [usize],
    /// Number of connections when they all converge on one core.
    pub connections: usize,
    /// Port distance between consecutive rows of the all-to-all matrix.
    pub port_stride: usize,
}

fn port_at(base: u16, offset: usize) -> Result<u16, ConfigurationError> {
    let port = base as usize + offset;
    if port > u16::MAX as usize {
        return Err(ConfigurationError::PortOverflow { base, offset });
    }
    Ok(port as u16)
}

pub fn check_cpus(cpus: &[usize]) -> Result<(), ConfigurationError> {
    if cpus.is_empty() {
        return Err(ConfigurationError::EmptyCpuSet);
    }
    let mut seen = HashSet::with_capacity(cpus.len());
    for &cpu in cpus {
        if !seen.insert(cpu) {
            return Err(ConfigurationError::DuplicateCpu(cpu));
        }
    }
    Ok(())
}

impl<'a> Topology<'a> {
    /// Whether every connection on this side lands on `cpus[0]`.
    /// Incast fans in at the receiver; outcast fans out from the sender.
    pub fn converges(&self) -> bool {
        matches!(
            (self.side, self.mode),
            (Side::Sender, TopologyMode::Outcast) | (Side::Receiver, TopologyMode::Incast)
        )
    }

    /// Ordered (cpu, port) assignment, stable for identical input.
    pub fn flows(&self, base_port: u16) -> Result<Vec<Flow>, ConfigurationError> {
        check_cpus(self.cpus)?;
        let mut flows = Vec::new();
        match self.mode {
            TopologyMode::AllToAll => {
                for (i, &sender_cpu) in self.cpus.iter().enumerate() {
                    for (j, &receiver_cpu) in self.cpus.iter().enumerate() {
                        let cpu = match self.side {
                            Side::Sender => sender_cpu,
                            Side::Receiver => receiver_cpu,
                        };
                        let port = port_at(base_port, self.port_stride * i + j)?;
                        flows.push(Flow { cpu, port });
                    }
                }
            }
            _ if self.converges() => {
                for n in 0..self.connections {
                    let port = port_at(base_port, n)?;
                    flows.push(Flow {
                        cpu: self.cpus[0],
                        port,
                    });
                }
            }
            _ => {
                for (n, &cpu) in self.cpus.iter().enumerate() {
                    let port = port_at(base_port, n)?;
                    flows.push(Flow { cpu, port });
                }
            }
        }
        Ok(flows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub side: Side,
    pub mode: TopologyMode,
    pub cpus: Vec<usize>,
    /// Connections for converging modes; `cpus.len()` is the usual choice.
    pub connections: usize,
    pub rpc_count: usize,
    pub iperf_base: u16,
    pub netperf_base: u16,
    pub capacity: Capacity,
}

/// Compute the full rule sequence for one host. Nothing is returned unless
/// every rule fits the table.
pub fn plan(req: &PlanRequest) -> Result<Vec<Rule>, ConfigurationError> {
    check_cpus(&req.cpus)?;
    let cap = req.capacity;
    if req.cpus.len() > cap.max_connections {
        return Err(ConfigurationError::TooManyCpus {
            cpus: req.cpus.len(),
            max: cap.max_connections,
        });
    }
    if req.rpc_count > cap.max_rpcs {
        return Err(ConfigurationError::TooManyRpcs {
            rpcs: req.rpc_count,
            max: cap.max_rpcs,
        });
    }

    let topo = Topology {
        side: req.side,
        mode: req.mode,
        cpus: &req.cpus,
        connections: req.connections,
        port_stride: req.cpus.len(),
    };
    let flows = topo.flows(req.iperf_base)?;
    if flows.len() > cap.max_flows() {
        return Err(ConfigurationError::TooManyFlows {
            flows: flows.len(),
            max: cap.max_flows(),
        });
    }

    let half = cap.half();
    let mut rules = Vec::with_capacity(2 * (flows.len() + req.rpc_count));
    for (n, flow) in flows.iter().enumerate() {
        // the irq core is the sibling right after the application core
        let queue = queue_for(flow.cpu + 1)?;
        rules.extend_from_slice(&Rule::pair(Transport::Tcp4, flow.port, queue, n, half));
    }

    let rpc_queue = queue_for(req.cpus[0] + 1)?;
    for k in 0..req.rpc_count {
        let port = port_at(req.netperf_base, k)?;
        rules.extend_from_slice(&Rule::pair(Transport::Tcp4, port, rpc_queue, cap.max_flows() + k, half));
    }

    if let Some(rule) = rules.iter().find(|r| r.slot >= cap.table_size()) {
        return Err(ConfigurationError::TableOverflow {
            slot: rule.slot,
            size: cap.table_size(),
        });
    }

    log::debug!(
        "planned {} rules for {} flows and {} rpcs ({} {})",
        rules.len(),
        flows.len(),
        req.rpc_count,
        req.side,
        req.mode
    );
    Ok(rules)
}
