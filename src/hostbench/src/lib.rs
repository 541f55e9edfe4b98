//! Orchestration of a two-host network benchmark: barrier-synchronized
//! phases of traffic generators and profilers, reduced into tables.
use thiserror::Error;

pub mod argument;
pub mod config;
pub mod driver;
pub mod experiment;
pub mod process;
pub mod reduce;
pub mod sync;
pub mod tools;

pub use experiment::ExperimentKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sync Error: {0}")]
    Sync(#[from] sync::SyncError),
    #[error("Process Error: {0}")]
    Process(#[from] process::ProcessError),
    #[error("Configuration Error: {0}")]
    Config(#[from] steering::ConfigurationError),
}

pub type Result<T> = std::result::Result<T, Error>;
