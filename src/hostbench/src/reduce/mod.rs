//! Pure text to metric reducers for the output of each tool.
//!
//! Every parser takes the captured lines of one process and never does I/O.
//! A parse failure is a [`ParseError`]; callers count it as a zero metric.
use thiserror::Error;

pub mod iperf;
pub mod netperf;
pub mod perf_report;
pub mod perf_stat;
pub mod sar;

pub use iperf::{parse_iperf, sum_throughput, ThroughputSum};
pub use netperf::{parse_netperf, RpcStats};
pub use perf_report::{parse_perf_report, Breakdown, Category, SymbolMap};
pub use perf_stat::{parse_perf_stat, CacheStats};
pub use sar::{parse_sar, total_utilisation};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("no {what} found in {lines} lines of output")]
    Missing { what: &'static str, lines: usize },
    #[error("malformed {what}: `{line}`")]
    Malformed { what: &'static str, line: String },
}

impl ParseError {
    fn missing(what: &'static str, lines: &[String]) -> Self {
        ParseError::Missing {
            what,
            lines: lines.len(),
        }
    }
}

/// Parse a float that may carry thousands separators or a trailing `%`.
pub(crate) fn parse_number(token: &str) -> Option<f64> {
    let cleaned: String = token
        .trim_end_matches('%')
        .chars()
        .filter(|&c| c != ',')
        .collect();
    cleaned.parse().ok()
}
