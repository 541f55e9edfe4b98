//! netperf TCP_RR with `-o throughput,P50_LATENCY,P90_LATENCY,P99_LATENCY`.
use super::{parse_number, ParseError};

/// One request/response instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RpcStats {
    /// Transactions per second
    pub transactions: f64,
    /// Latency percentiles in microseconds
    pub p50_us: f64,
    pub p90_us: f64,
    pub p99_us: f64,
}

impl RpcStats {
    /// Mean of the given instances, `None` when there are none.
    pub fn mean(stats: &[RpcStats]) -> Option<RpcStats> {
        if stats.is_empty() {
            return None;
        }
        let n = stats.len() as f64;
        let sum = stats.iter().fold(RpcStats::default(), |acc, s| RpcStats {
            transactions: acc.transactions + s.transactions,
            p50_us: acc.p50_us + s.p50_us,
            p90_us: acc.p90_us + s.p90_us,
            p99_us: acc.p99_us + s.p99_us,
        });
        Some(RpcStats {
            transactions: sum.transactions / n,
            p50_us: sum.p50_us / n,
            p90_us: sum.p90_us / n,
            p99_us: sum.p99_us / n,
        })
    }
}

/// The last all-numeric CSV row of four fields is the result row.
pub fn parse_netperf(lines: &[String]) -> Result<RpcStats, ParseError> {
    lines
        .iter()
        .rev()
        .find_map(|line| {
            let fields: Vec<f64> = line
                .trim()
                .split(',')
                .map(|f| parse_number(f.trim()))
                .collect::<Option<_>>()?;
            match fields.as_slice() {
                &[transactions, p50_us, p90_us, p99_us] => Some(RpcStats {
                    transactions,
                    p50_us,
                    p90_us,
                    p99_us,
                }),
                _ => None,
            }
        })
        .ok_or_else(|| ParseError::missing("netperf result row", lines))
}
