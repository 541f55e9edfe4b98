//! Invocation contracts of the external measurement tools.
use crate::process::Invocation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Where the tools live on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub taskset: String,
    pub iperf: String,
    pub netperf: String,
    pub netserver: String,
    pub sar: String,
    pub perf: String,
    /// Checkout of brendangregg/FlameGraph
    pub flamegraph_dir: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            taskset: "taskset".to_owned(),
            iperf: "iperf".to_owned(),
            netperf: "netperf".to_owned(),
            netserver: "netserver".to_owned(),
            sar: "sar".to_owned(),
            perf: "perf".to_owned(),
            flamegraph_dir: "FlameGraph".to_owned(),
        }
    }
}

/// Events sampled by `perf record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// Default cycles event, for CPU utilisation breakdown
    Cycles,
    /// cache-misses event
    CacheMisses,
    /// Call graphs at 99 Hz for flame graphs
    CallGraph,
}

/// Sorted, deduplicated `-C`/`-P` style core list.
pub fn cpu_list(cpus: &[usize]) -> String {
    let set: BTreeSet<usize> = cpus.iter().copied().collect();
    set.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
}

fn pinned(paths: &ToolPaths, cpu: usize, program: &str) -> Invocation {
    Invocation::new(&paths.taskset)
        .arg("-c")
        .arg(cpu)
        .arg(program)
}

/// Stream client; `window_kib` is split between the two directions.
pub fn iperf_client(
    paths: &ToolPaths,
    cpu: usize,
    addr: &str,
    port: u16,
    duration: u32,
    window_kib: Option<u32>,
) -> Invocation {
    let inv = pinned(paths, cpu, &paths.iperf)
        .arg("-i")
        .arg(1)
        .arg("-c")
        .arg(addr)
        .arg("-t")
        .arg(duration)
        .arg("-p")
        .arg(port);
    match window_kib {
        Some(w) => inv.arg("-w").arg(format!("{}K", w / 2)),
        None => inv,
    }
}

pub fn iperf_server(paths: &ToolPaths, cpu: usize, port: u16, window_kib: Option<u32>) -> Invocation {
    let inv = pinned(paths, cpu, &paths.iperf)
        .arg("-s")
        .arg("-i")
        .arg(1)
        .arg("-p")
        .arg(port);
    match window_kib {
        Some(w) => inv.arg("-w").arg(format!("{}K", w / 2)),
        None => inv,
    }
}

/// Request/response client reporting throughput and latency percentiles.
pub fn netperf(paths: &ToolPaths, cpu: usize, addr: &str, port: u16, duration: u32) -> Invocation {
    pinned(paths, cpu, &paths.netperf)
        .arg("-H")
        .arg(addr)
        .arg("-t")
        .arg("TCP_RR")
        .arg("-l")
        .arg(duration)
        .arg("-p")
        .arg(port)
        .arg("--")
        .arg("-r")
        .arg("4000,4000")
        .arg("-o")
        .arg("throughput,P50_LATENCY,P90_LATENCY,P99_LATENCY")
}

pub fn netserver(paths: &ToolPaths, cpu: usize, port: u16) -> Invocation {
    pinned(paths, cpu, &paths.netserver)
        .arg("-D")
        .arg("-p")
        .arg(port)
}

/// Per-core utilisation every second until interrupted.
pub fn sar(paths: &ToolPaths, cpus: &[usize]) -> Invocation {
    Invocation::new(&paths.sar)
        .arg("-u")
        .arg("-P")
        .arg(cpu_list(cpus))
        .arg(1)
        .arg(1000)
}

pub fn perf_stat_cache(paths: &ToolPaths, cpus: &[usize]) -> Invocation {
    Invocation::new(&paths.perf)
        .arg("stat")
        .arg("-C")
        .arg(cpu_list(cpus))
        .arg("-e")
        .arg("LLC-loads,LLC-load-misses,LLC-stores,LLC-store-misses")
}

pub fn perf_record(paths: &ToolPaths, cpus: &[usize], mode: RecordMode, data: &Path) -> Invocation {
    let inv = Invocation::new(&paths.perf).arg("record");
    let inv = match mode {
        RecordMode::Cycles => inv,
        RecordMode::CacheMisses => inv.arg("-e").arg("cache-misses"),
        RecordMode::CallGraph => inv.arg("-g").arg("-F").arg(99),
    };
    inv.arg("-C")
        .arg(cpu_list(cpus))
        .arg("-o")
        .arg(data.display())
}

/// Flat text report of a recorded profile, piped so perf never pages.
pub fn perf_report(paths: &ToolPaths, data: &Path) -> Invocation {
    Invocation::new("bash").arg("-c").arg(format!(
        "{} report --stdio --stdio-color never --percent-limit 0.01 -i {} | cat",
        paths.perf,
        data.display()
    ))
}

pub fn flamegraph(paths: &ToolPaths, data: &Path, folded: &Path, svg: &Path) -> Invocation {
    let dir = &paths.flamegraph_dir;
    Invocation::new("bash").arg("-c").arg(format!(
        "{perf} script -i {data} | {dir}/stackcollapse-perf.pl > {folded} && {dir}/flamegraph.pl {folded} > {svg}",
        perf = paths.perf,
        data = data.display(),
        dir = dir,
        folded = folded.display(),
        svg = svg.display(),
    ))
}

/// Kill leftovers of a previous run.
pub fn pkill(name: &str) -> Invocation {
    Invocation::new("pkill").arg(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iperf_client_command() {
        let paths = ToolPaths::default();
        assert_eq!(
            iperf_client(&paths, 4, "10.0.0.2", 30001, 20, None).to_string(),
            "taskset -c 4 iperf -i 1 -c 10.0.0.2 -t 20 -p 30001"
        );
        assert_eq!(
            iperf_client(&paths, 4, "10.0.0.2", 30001, 20, Some(256)).to_string(),
            "taskset -c 4 iperf -i 1 -c 10.0.0.2 -t 20 -p 30001 -w 128K"
        );
    }

    #[test]
    fn netperf_command() {
        let inv = netperf(&ToolPaths::default(), 0, "10.0.0.2", 40000, 20);
        assert_eq!(
            inv.to_string(),
            "taskset -c 0 netperf -H 10.0.0.2 -t TCP_RR -l 20 -p 40000 -- -r 4000,4000 -o throughput,P50_LATENCY,P90_LATENCY,P99_LATENCY"
        );
    }

    #[test]
    fn profilers_dedup_cores() {
        let paths = ToolPaths::default();
        assert_eq!(cpu_list(&[4, 0, 5, 1, 4]), "0,1,4,5");
        assert_eq!(sar(&paths, &[2, 0, 1]).to_string(), "sar -u -P 0,1,2 1 1000");
        let record = perf_record(&paths, &[0, 1], RecordMode::CallGraph, Path::new("/tmp/x/perf.data"));
        assert_eq!(record.to_string(), "perf record -g -F 99 -C 0,1 -o /tmp/x/perf.data");
        let record = perf_record(&paths, &[0], RecordMode::CacheMisses, Path::new("p.data"));
        assert_eq!(record.args[..3], ["record", "-e", "cache-misses"]);
    }

    #[test]
    fn report_is_piped() {
        let paths = ToolPaths {
            perf: "/opt/bin/perf".to_owned(),
            ..Default::default()
        };
        let inv = perf_report(&paths, Path::new("perf.data"));
        assert_eq!(inv.program, "bash");
        assert_eq!(
            inv.args[1],
            "/opt/bin/perf report --stdio --stdio-color never --percent-limit 0.01 -i perf.data | cat"
        );
    }
}
