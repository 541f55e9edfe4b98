//! Programs the NIC ntuple table.
//!
//! The table is a singleton per interface, so the only supported discipline is
//! a full replace: a [`RuleTableSession`] must be cleared, which yields a
//! [`ClearedTable`], and only a cleared table accepts rules.
use crate::planner::{Capacity, Rule};
use std::collections::BTreeMap;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NicError {
    #[error("no such rule")]
    NotFound,
    #[error("{0}")]
    Failed(String),
}

/// The external collaborator that actually talks to the driver.
pub trait NicControl {
    fn install(&mut self, rule: &Rule) -> Result<(), NicError>;
    fn delete(&mut self, slot: usize) -> Result<(), NicError>;
}

impl<T: NicControl + ?Sized> NicControl for &mut T {
    fn install(&mut self, rule: &Rule) -> Result<(), NicError> {
        (**self).install(rule)
    }
    fn delete(&mut self, slot: usize) -> Result<(), NicError> {
        (**self).delete(slot)
    }
}

/// `ethtool -U` backed NIC control.
#[derive(Debug, Clone)]
pub struct Ethtool {
    iface: String,
    dry_run: bool,
}

impl Ethtool {
    pub fn new(iface: &str, dry_run: bool) -> Self {
        Ethtool {
            iface: iface.to_owned(),
            dry_run,
        }
    }

    fn run(&self, args: &[String]) -> Result<(), NicError> {
        let mut cmd = Command::new("ethtool");
        cmd.arg("-U").arg(&self.iface).args(args);
        if self.dry_run {
            log::info!("(dry run) {}", utils::cmd_helper::get_command_str(&cmd));
            return Ok(());
        }
        let output = utils::cmd_helper::run_command(cmd).map_err(|e| NicError::Failed(e.to_string()))?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr.trim();
        if is_missing_rule(stderr) {
            Err(NicError::NotFound)
        } else {
            Err(NicError::Failed(format!(
                "{}: {}",
                utils::cmd_helper::describe_status(output.status),
                stderr
            )))
        }
    }
}

// ethtool reports deleting an empty location as ENOENT, some drivers as EINVAL
fn is_missing_rule(stderr: &str) -> bool {
    stderr.contains("No such file or directory") || stderr.contains("Invalid argument")
}

impl NicControl for Ethtool {
    fn install(&mut self, rule: &Rule) -> Result<(), NicError> {
        let args: Vec<String> = rule.to_string().split(' ').map(str::to_owned).collect();
        match self.run(&args) {
            // a missing rule makes no sense on insert
            Err(NicError::NotFound) => Err(NicError::Failed(format!("rejected: {}", rule))),
            other => other,
        }
    }

    fn delete(&mut self, slot: usize) -> Result<(), NicError> {
        self.run(&["delete".to_owned(), slot.to_string()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to install rule `{rule}`: {reason}")]
pub struct RuleInstallError {
    pub rule: Rule,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub deleted: usize,
    pub absent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: usize,
    pub failures: Vec<RuleInstallError>,
}

impl InstallReport {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Exclusive handle on one interface's rule table.
pub struct RuleTableSession<C> {
    nic: C,
    capacity: Capacity,
}

impl<C: NicControl> RuleTableSession<C> {
    pub fn open(nic: C, capacity: Capacity) -> Self {
        RuleTableSession { nic, capacity }
    }

    /// Delete every slot of the table; empty slots are expected.
    pub fn clear(self) -> ClearedTable<C> {
        let (nic, report) = clear_all(self.nic, self.capacity);
        ClearedTable {
            nic,
            capacity: self.capacity,
            last_clear: report,
            installed: BTreeMap::new(),
        }
    }
}

fn clear_all<C: NicControl>(mut nic: C, capacity: Capacity) -> (C, ClearReport) {
    let mut report = ClearReport::default();
    for slot in 0..capacity.table_size() {
        match nic.delete(slot) {
            Ok(()) => report.deleted += 1,
            Err(NicError::NotFound) => report.absent += 1,
            Err(NicError::Failed(e)) => {
                log::warn!("failed to delete rule at loc {}: {}", slot, e);
                report.failed += 1;
            }
        }
    }
    log::info!(
        "cleared rule table: {} deleted, {} already empty, {} failed",
        report.deleted,
        report.absent,
        report.failed
    );
    (nic, report)
}

/// A rule table known to be empty at the start of this session.
pub struct ClearedTable<C> {
    nic: C,
    capacity: Capacity,
    last_clear: ClearReport,
    installed: BTreeMap<usize, Rule>,
}

impl<C: NicControl> ClearedTable<C> {
    /// Install `rules` in order. Failures are reported, earlier successes stay.
    pub fn install(&mut self, rules: &[Rule]) -> InstallReport {
        let mut report = InstallReport::default();
        for rule in rules {
            let reject = |reason: String| RuleInstallError {
                rule: *rule,
                reason,
            };
            if rule.slot >= self.capacity.table_size() {
                report.failures.push(reject(format!(
                    "loc outside table of {} rules",
                    self.capacity.table_size()
                )));
                continue;
            }
            if self.installed.contains_key(&rule.slot) {
                report.failures.push(reject("duplicate loc".to_owned()));
                continue;
            }
            match self.nic.install(rule) {
                Ok(()) => {
                    self.installed.insert(rule.slot, *rule);
                    report.installed += 1;
                }
                Err(e) => report.failures.push(reject(e.to_string())),
            }
        }
        for failure in &report.failures {
            log::warn!("{}", failure);
        }
        log::info!(
            "installed {} of {} rules",
            report.installed,
            rules.len()
        );
        report
    }

    /// Start over: wipe the table again before a new install.
    pub fn clear(self) -> ClearedTable<C> {
        RuleTableSession::open(self.nic, self.capacity).clear()
    }

    #[inline]
    pub fn last_clear(&self) -> ClearReport {
        self.last_clear
    }

    #[inline]
    pub fn installed(&self) -> impl Iterator<Item = &Rule> {
        self.installed.values()
    }

    pub fn into_inner(self) -> C {
        self.nic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, MatchField, PlanRequest, Side, TopologyMode, Transport};

    /// In-memory NIC with a real table, rejecting a configurable set of ports.
    #[derive(Debug, Default)]
    struct FakeNic {
        pub table: BTreeMap<usize, Rule>,
        pub calls: Vec<String>,
        pub reject_ports: Vec<u16>,
    }

    impl NicControl for FakeNic {
        fn install(&mut self, rule: &Rule) -> Result<(), NicError> {
            self.calls.push(format!("install {}", rule.slot));
            if self.reject_ports.contains(&rule.port) {
                return Err(NicError::Failed("Operation not supported".to_owned()));
            }
            if self.table.contains_key(&rule.slot) {
                return Err(NicError::Failed("File exists".to_owned()));
            }
            self.table.insert(rule.slot, *rule);
            Ok(())
        }

        fn delete(&mut self, slot: usize) -> Result<(), NicError> {
            self.calls.push(format!("delete {}", slot));
            self.table.remove(&slot).map(|_| ()).ok_or(NicError::NotFound)
        }
    }

    fn rule(port: u16, slot: usize) -> Rule {
        Rule {
            transport: Transport::Tcp4,
            field: MatchField::DstPort,
            port,
            queue: 6,
            slot,
        }
    }

    #[test]
    fn clearing_an_empty_table_is_silent() {
        let cap = Capacity::new(2, 1);
        let table = RuleTableSession::open(FakeNic::default(), cap).clear();
        assert_eq!(
            table.last_clear(),
            ClearReport {
                deleted: 0,
                absent: 10,
                failed: 0
            }
        );
    }

    #[test]
    fn reinstall_replaces_stale_rules() {
        let cap = Capacity::new(2, 1);
        let mut nic = FakeNic::default();
        nic.table.insert(3, rule(1234, 3));

        let mut table = RuleTableSession::open(&mut nic, cap).clear();
        assert_eq!(table.last_clear().deleted, 1);
        let report = table.install(&[rule(30000, 0), rule(30001, 1)]);
        assert!(report.is_complete());

        let table = table.clear();
        assert_eq!(table.last_clear().deleted, 2);
        drop(table);
        assert!(nic.table.is_empty());
    }

    #[test]
    fn failures_do_not_roll_back() {
        let cap = Capacity::new(2, 1);
        let nic = FakeNic {
            reject_ports: vec![30001],
            ..Default::default()
        };
        let mut table = RuleTableSession::open(nic, cap).clear();
        let report = table.install(&[rule(30000, 0), rule(30001, 1), rule(30002, 0), rule(30003, 10), rule(30004, 2)]);
        assert_eq!(report.installed, 2);
        let reasons: Vec<&str> = report.failures.iter().map(|f| f.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "Operation not supported",
                "duplicate loc",
                "loc outside table of 10 rules"
            ]
        );
        let nic = table.into_inner();
        assert_eq!(nic.table.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        // out-of-table and duplicate rules never reach the nic
        assert!(!nic.calls.contains(&"install 10".to_owned()));
        assert_eq!(nic.calls.iter().filter(|c| *c == "install 0").count(), 1);
    }

    #[test]
    fn planned_all_to_all_installs_cleanly() {
        let req = PlanRequest {
            side: Side::Sender,
            mode: TopologyMode::AllToAll,
            cpus: vec![0, 2, 4],
            connections: 3,
            rpc_count: 2,
            iperf_base: 30000,
            netperf_base: 40000,
            capacity: Capacity::new(3, 2),
        };
        let rules = plan(&req).unwrap();
        let mut table = RuleTableSession::open(FakeNic::default(), req.capacity).clear();
        let report = table.install(&rules);
        assert!(report.is_complete());
        assert_eq!(report.installed, 22);
        assert_eq!(table.installed().count(), req.capacity.table_size());
    }

    #[test]
    fn missing_rule_detection() {
        assert!(is_missing_rule("Cannot delete RX class rule: No such file or directory"));
        assert!(is_missing_rule("rmgr: Cannot delete RX class rule: Invalid argument"));
        assert!(!is_missing_rule("Cannot get RX class rule count: Operation not supported"));
    }
}
