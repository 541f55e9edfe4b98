//! iperf interval reports.
//!
//! ```text
//! [  3]  0.0- 1.0 sec  1.09 GBytes  9.35 Gbits/sec
//! [  3]  0.0-20.0 sec  21.9 GBytes  9.40 Gbits/sec
//! ```
use super::ParseError;

/// Scale from a rate unit to Gbps.
fn unit_scale(unit: &str) -> Option<f64> {
    let scale = match unit {
        "bits/sec" | "bps" => 1e-9,
        "Kbits/sec" | "Kbps" => 1e-6,
        "Mbits/sec" | "Mbps" => 1e-3,
        "Gbits/sec" | "Gbps" => 1.0,
        _ => return None,
    };
    Some(scale)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RateLine {
    interval: Option<(f64, f64)>,
    gbps: f64,
}

fn parse_interval(text: &str) -> Option<(f64, f64)> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parts = compact.splitn(2, '-');
    let start = parts.next()?.parse().ok()?;
    let end = parts.next()?.parse().ok()?;
    Some((start, end))
}

fn parse_rate_line(line: &str) -> Option<RateLine> {
    // drop the `[ ID]` column
    let body = match line.trim_start().strip_prefix('[') {
        Some(rest) => rest.splitn(2, ']').nth(1)?,
        None => line,
    };
    let mut tokens: Vec<&str> = body.split_whitespace().collect();
    // iperf3 appends the role to the summary lines
    if matches!(tokens.last(), Some(&"sender") | Some(&"receiver")) {
        tokens.pop();
    }
    let (value, unit) = match tokens.as_slice() {
        [.., value, unit] => (*value, *unit),
        _ => return None,
    };
    let gbps = value.parse::<f64>().ok()? * unit_scale(unit)?;
    let interval = body.find(" sec").and_then(|at| parse_interval(&body[..at]));
    Some(RateLine { interval, gbps })
}

/// Throughput of one iperf instance in Gbps.
///
/// The summary line is the interval starting at 0 that reaches as far as any
/// interval line does. Output with interval lines but no such summary was cut
/// short and is an error. Without interval lines the last rate line is used.
pub fn parse_iperf(lines: &[String]) -> Result<f64, ParseError> {
    let rates: Vec<RateLine> = lines.iter().filter_map(|l| parse_rate_line(l)).collect();

    let last_end = rates
        .iter()
        .filter_map(|r| r.interval.map(|(_, end)| end))
        .fold(None, |best: Option<f64>, end| Some(best.map_or(end, |b| b.max(end))));
    let last_end = match last_end {
        Some(end) => end,
        None => {
            return rates
                .last()
                .map(|r| r.gbps)
                .ok_or_else(|| ParseError::missing("iperf rate line", lines))
        }
    };

    rates
        .iter()
        .rev()
        .find(|r| match r.interval {
            Some((start, end)) => start == 0.0 && (end - last_end).abs() < 1e-6,
            None => false,
        })
        .map(|r| r.gbps)
        .ok_or_else(|| ParseError::missing("iperf summary line", lines))
}

/// Summed throughput across instances; failed instances contribute zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThroughputSum {
    pub total: f64,
    pub per_instance: Vec<f64>,
    pub errors: Vec<(usize, ParseError)>,
}

pub fn sum_throughput<T: AsRef<[String]>>(instances: &[T]) -> ThroughputSum {
    let mut sum = ThroughputSum::default();
    for (i, lines) in instances.iter().enumerate() {
        let gbps = match parse_iperf(lines.as_ref()) {
            Ok(gbps) => gbps,
            Err(e) => {
                log::warn!("iperf instance {}: {}", i, e);
                sum.errors.push((i, e));
                0.0
            }
        };
        sum.per_instance.push(gbps);
        sum.total += gbps;
    }
    sum
}
