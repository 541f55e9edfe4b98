//! Scripted stand-ins for the external tools.
use std::sync::{Arc, Mutex};

use hostbench::process::{Exit, Invocation, Launcher, ProcHandle, ProcessError};

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// What a recorded invocation was.
pub fn role(inv: &Invocation) -> &'static str {
    let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();
    match (inv.program.as_str(), args.as_slice()) {
        ("taskset", [_, _, "iperf", "-s", ..]) => "iperf-server",
        ("taskset", [_, _, "iperf", ..]) => "iperf",
        ("taskset", [_, _, "netperf", ..]) => "netperf",
        ("taskset", [_, _, "netserver", ..]) => "netserver",
        ("sar", _) => "sar",
        ("perf", ["stat", ..]) => "perf-stat",
        ("perf", ["record", ..]) => "perf-record",
        ("bash", [_, script]) if script.contains(" report ") => "perf-report",
        ("bash", _) => "flamegraph",
        ("pkill", _) => "pkill",
        _ => "unknown",
    }
}

fn output_of(role: &str, failing: bool) -> Vec<String> {
    let text = match role {
        "iperf" if failing => "connect failed: Connection refused",
        "iperf" => "[  3] local 10.0.0.1 port 51234 connected with 10.0.0.2 port 30000
[ ID] Interval       Transfer     Bandwidth
[  3]  0.0- 5.0 sec   600 MBytes  1.007 Gbits/sec
[  3]  0.0-10.0 sec  1.16 GBytes  1.000 Gbits/sec",
        "netperf" => "MIGRATED TCP REQUEST/RESPONSE TEST from 0.0.0.0 (0.0.0.0) port 0 AF_INET to 10.0.0.2 () port 40000 AF_INET
Throughput,50th Percentile Latency Microseconds,90th Percentile Latency Microseconds,99th Percentile Latency Microseconds
9000.00,50,60,70",
        "sar" => "Linux 5.4.0 (host) \t10/17/2026 \t_x86_64_\t(24 CPU)

12:00:01     CPU     %user     %nice   %system   %iowait    %steal     %idle
12:00:02       0     20.00      0.00     10.00      0.00      0.00     70.00

Average:     CPU     %user     %nice   %system   %iowait    %steal     %idle
Average:       0      5.00      0.00      5.00      0.00      0.00     90.00
Average:       1      0.00      0.00      5.00      0.00      0.00     95.00",
        "perf-stat" => " Performance counter stats for 'CPU(s) 0,1':

         1,000,000      LLC-loads
           100,000      LLC-load-misses
         1,000,000      LLC-stores
           100,000      LLC-store-misses",
        "perf-report" => "# Overhead  Command  Shared Object      Symbol
#
    60.00%  iperf    [kernel.kallsyms]  [k] copy_user_enhanced_fast_string
            |
            ---copy_user_enhanced_fast_string
    38.00%  iperf    [kernel.kallsyms]  [k] tcp_sendmsg",
        _ => "",
    };
    text.lines().map(str::to_owned).collect()
}

/// Records every call into a shared log as `start <role> #h`, `wait #h`,
/// `interrupt #h`; the outputs are canned.
pub struct MockLauncher {
    pub log: EventLog,
    /// prefixes every event, to tell two hosts apart in one log
    pub tag: &'static str,
    pub invocations: Vec<Invocation>,
    /// iperf clients fail to connect and exit with 1
    pub failing_iperf: bool,
}

impl MockLauncher {
    pub fn new(log: EventLog) -> Self {
        MockLauncher {
            log,
            tag: "",
            invocations: Vec::new(),
            failing_iperf: false,
        }
    }

    pub fn tagged(log: EventLog, tag: &'static str) -> Self {
        MockLauncher { tag, ..Self::new(log) }
    }

    fn record(&self, event: String) {
        self.log.lock().unwrap().push(format!("{}{}", self.tag, event));
    }

    fn invocation(&self, h: ProcHandle) -> Result<&Invocation, ProcessError> {
        self.invocations.get(h.0).ok_or(ProcessError::UnknownHandle(h))
    }
}

impl Launcher for MockLauncher {
    fn start(&mut self, inv: &Invocation) -> Result<ProcHandle, ProcessError> {
        let h = ProcHandle(self.invocations.len());
        self.record(format!("start {} #{}", role(inv), h.0));
        self.invocations.push(inv.clone());
        Ok(h)
    }

    fn interrupt(&mut self, h: ProcHandle) -> Result<(), ProcessError> {
        self.invocation(h)?;
        self.record(format!("interrupt #{}", h.0));
        Ok(())
    }

    fn wait(&mut self, h: ProcHandle) -> Result<Exit, ProcessError> {
        let failed = self.failing_iperf && role(self.invocation(h)?) == "iperf";
        self.record(format!("wait #{}", h.0));
        Ok(if failed { Exit::Code(1) } else { Exit::Code(0) })
    }

    fn collect_output(&mut self, h: ProcHandle) -> Vec<String> {
        match self.invocation(h) {
            Ok(inv) => output_of(role(inv), self.failing_iperf),
            Err(_) => Vec::new(),
        }
    }
}
