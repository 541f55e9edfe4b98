//! Flow steering: which CPU owns which connection, and which NIC receive queue
//! (and ntuple rule slot) serves it.
use thiserror::Error;

pub mod config;
pub mod installer;
pub mod planner;
pub mod queue;
pub mod setup;

pub use config::SteeringConfig;
pub use installer::{ClearedTable, Ethtool, InstallReport, NicControl, NicError, RuleTableSession};
pub use planner::{plan, Capacity, ConfigurationError, Flow, MatchField, PlanRequest, Rule, Side, Topology, TopologyMode, Transport};
pub use queue::{dma_queue_for, queue_for, OutOfRange};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("{0}")]
    OutOfRange(#[from] OutOfRange),
    #[error("Command failed: {0}")]
    Command(#[from] anyhow::Error),
    #[error("rule table must be cleared before install")]
    NotCleared,
}

pub type Result<T> = std::result::Result<T, Error>;
