use crate::planner::Capacity;
use serde::{Deserialize, Serialize};

/// Testbed constants shared by both hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SteeringConfig {
    /// Application cores, in connection order. Their `cpu + 1` siblings take the IRQs.
    pub cpus: Vec<usize>,
    /// Upper bound on request/response (netperf) connections.
    pub max_rpcs: usize,
    /// Base port of stream (iperf) connections
    pub iperf_base_port: u16,
    /// Base port of request/response (netperf) connections
    pub netperf_base_port: u16,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        SteeringConfig {
            cpus: vec![0, 2, 4, 6, 8, 12, 14, 16, 18, 20, 22],
            max_rpcs: 16,
            iperf_base_port: 30000,
            netperf_base_port: 40000,
        }
    }
}

impl SteeringConfig {
    #[inline]
    pub fn max_connections(&self) -> usize {
        self.cpus.len()
    }

    #[inline]
    pub fn capacity(&self) -> Capacity {
        Capacity::new(self.max_connections(), self.max_rpcs)
    }
}

pub fn read_config<T, P>(path: P) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
    P: AsRef<std::path::Path>,
{
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| anyhow::anyhow!("fail to open {}: {}", path.as_ref().display(), e))?;
    Ok(toml::from_str(&content)?)
}
