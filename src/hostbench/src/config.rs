use litemsg::RetryPolicy;
use serde::{Deserialize, Serialize};
use steering::config::read_config;
use steering::SteeringConfig;

use crate::reduce::SymbolMap;
use crate::tools::ToolPaths;

pub const DEFAULT_SYNC_PORT: u16 = 8080;

/// Settings of a benchmark host; every field has a testbed default.
///
/// ```toml
/// sync_port = 8080
/// min_percent = 0.01
///
/// [steering]
/// cpus = [0, 2, 4, 6]
///
/// [tools]
/// perf = "/home/user/bin/perf"
///
/// [retry]
/// interval_ms = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub steering: SteeringConfig,
    pub tools: ToolPaths,
    pub sync_port: u16,
    pub retry: RetryPolicy,
    /// perf report entries below this percentage are unaccounted
    pub min_percent: f64,
    /// Replaces the built-in kernel symbol categories
    pub symbols: Option<SymbolMap>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            steering: SteeringConfig::default(),
            tools: ToolPaths::default(),
            sync_port: DEFAULT_SYNC_PORT,
            retry: RetryPolicy::default(),
            min_percent: 0.01,
            symbols: None,
        }
    }
}

impl BenchConfig {
    pub fn symbols(&self) -> &SymbolMap {
        self.symbols.as_ref().unwrap_or_else(|| SymbolMap::kernel_default())
    }
}

pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<BenchConfig> {
    match path {
        Some(path) => {
            let config = read_config(path)?;
            log::debug!("config: {:?}", config);
            Ok(config)
        }
        None => Ok(Default::default()),
    }
}
