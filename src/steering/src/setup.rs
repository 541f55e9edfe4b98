//! Host and NIC knobs tuned before an experiment. Every function here only
//! renders shell lines; [`Shell`] runs them.
use crate::installer::{InstallReport, NicControl, RuleTableSession};
use crate::planner::{Rule, Side};
use crate::{Error, Result};

/// DDIO IO ways LLC mm register location
pub const DDIO_REG: u32 = 0xc8b;
/// Flow entries of the RPS socket flow table when RPS is enabled
pub const RPS_FLOW_ENTRIES: usize = 32768;
/// Socket buffer limit for `net.core.{w,r}mem_max`
pub const SOCK_MEM_MAX: usize = 12582912;

#[inline]
pub fn on_or_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Offloads {
    pub lro: Option<bool>,
    pub tso: Option<bool>,
    pub gso: Option<bool>,
    pub gro: Option<bool>,
    /// tx and rx checksumming
    pub checksum: Option<bool>,
}

impl Offloads {
    pub fn command(&self, iface: &str) -> Option<String> {
        let offloads = [
            ("lro", self.lro),
            ("tso", self.tso),
            ("gso", self.gso),
            ("gro", self.gro),
            ("tx", self.checksum),
            ("rx", self.checksum),
        ];
        let args: Vec<String> = offloads
            .iter()
            .filter_map(|(name, state)| state.map(|s| format!("{} {}", name, on_or_off(s))))
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(format!("ethtool -K {} {}", iface, args.join(" ")))
        }
    }
}

pub fn stop_irq_balance() -> String {
    "service irqbalance stop".to_owned()
}

pub fn ntuple(iface: &str, enabled: bool) -> String {
    format!("ethtool -K {} ntuple {}", iface, on_or_off(enabled))
}

pub fn rps(iface: &str, enabled: bool) -> Vec<String> {
    let entries = if enabled { RPS_FLOW_ENTRIES } else { 0 };
    vec![
        format!("echo {} > /proc/sys/net/core/rps_sock_flow_entries", entries),
        format!(
            "for f in /sys/class/net/{}/queues/rx-*/rps_flow_cnt; do echo {} > $f; done",
            iface, entries
        ),
    ]
}

pub fn irq_affinity(iface: &str) -> String {
    format!("set_irq_affinity.sh {} 2> /dev/null > /dev/null", iface)
}

pub fn speed(iface: &str, mbps: u32) -> String {
    format!("ethtool -s {} speed {} autoneg off", iface, mbps)
}

pub fn mtu(iface: &str, mtu: u32) -> String {
    format!("ifconfig {} mtu {}", iface, mtu)
}

pub fn ring_buffer(iface: &str, size: u32) -> String {
    format!("ethtool -G {0} rx {1} tx {1}", iface, size)
}

pub fn sock_size() -> String {
    format!(
        "sysctl -w net.core.wmem_max={0} && sysctl -w net.core.rmem_max={0}",
        SOCK_MEM_MAX
    )
}

/// Way mask giving DDIO the `ways` highest of the 11 LLC ways.
pub fn ddio_mask(ways: u32) -> u64 {
    ((1u64 << ways) - 1) << (11 - ways)
}

pub fn ddio(ways: u32) -> Vec<String> {
    vec![
        "modprobe msr".to_owned(),
        format!("wrmsr {:#x} {:#x}", DDIO_REG, ddio_mask(ways)),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    /// Accelerated RFS, the kernel steers flows itself.
    Arfs,
    /// RPS off, static ntuple rules for this side.
    Pinned(Side),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Shell(String),
    ClearRules,
    InstallRules,
}

/// The ordered steps putting `iface` in `mode`.
pub fn irq_mode_steps(iface: &str, mode: IrqMode) -> Vec<Step> {
    let mut steps = vec![Step::Shell(stop_irq_balance())];
    let rps_enabled = mode == IrqMode::Arfs;
    steps.extend(rps(iface, rps_enabled).into_iter().map(Step::Shell));
    steps.push(Step::Shell(ntuple(iface, true)));
    match mode {
        IrqMode::Arfs => {
            steps.push(Step::Shell(irq_affinity(iface)));
            steps.push(Step::ClearRules);
        }
        IrqMode::Pinned(_) => {
            steps.push(Step::ClearRules);
            steps.push(Step::Shell(irq_affinity(iface)));
            steps.push(Step::InstallRules);
        }
    }
    steps
}

/// Runs shell lines, or only logs them in dry-run mode.
#[derive(Debug, Clone, Copy)]
pub struct Shell {
    pub dry_run: bool,
}

impl Shell {
    pub fn run(&self, line: &str) -> Result<()> {
        if self.dry_run {
            log::info!("(dry run) {}", line);
            return Ok(());
        }
        utils::cmd_helper::run_shell(line)?;
        Ok(())
    }

    /// Like [`Shell::run`], but a failure is only a warning.
    pub fn run_all<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            if let Err(e) = self.run(line.as_ref()) {
                log::warn!("{}", e);
            }
        }
    }
}

/// Walks [`irq_mode_steps`], clearing the rule table through `session` and
/// installing `rules` once it is clear. Returns the install report in pinned
/// mode.
pub fn apply_irq_mode<C: NicControl>(
    shell: Shell,
    iface: &str,
    mode: IrqMode,
    session: RuleTableSession<C>,
    rules: &[Rule],
) -> Result<Option<InstallReport>> {
    let mut session = Some(session);
    let mut table = None;
    let mut report = None;
    for step in irq_mode_steps(iface, mode) {
        match step {
            Step::Shell(line) => shell.run_all(Some(line)),
            Step::ClearRules => table = session.take().map(|s| s.clear()),
            Step::InstallRules => {
                let table = table.as_mut().ok_or(Error::NotCleared)?;
                let installed = table.install(rules);
                if !installed.is_complete() {
                    log::warn!("{} rules failed to install", installed.failures.len());
                }
                report = Some(installed);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::NicError;
    use crate::planner::{plan, Capacity, PlanRequest, TopologyMode};

    #[derive(Debug, Default)]
    struct RecordingNic {
        calls: Vec<String>,
    }

    impl NicControl for RecordingNic {
        fn install(&mut self, rule: &Rule) -> std::result::Result<(), NicError> {
            self.calls.push(format!("install {}", rule.slot));
            Ok(())
        }

        fn delete(&mut self, slot: usize) -> std::result::Result<(), NicError> {
            self.calls.push(format!("delete {}", slot));
            Err(NicError::NotFound)
        }
    }

    fn planned(side: Side) -> Vec<Rule> {
        plan(&PlanRequest {
            side,
            mode: TopologyMode::OneToOne,
            cpus: vec![0, 2],
            connections: 2,
            rpc_count: 1,
            iperf_base: 30000,
            netperf_base: 40000,
            capacity: Capacity::new(2, 1),
        })
        .unwrap()
    }

    #[test]
    fn offload_command_skips_unset() {
        assert_eq!(Offloads::default().command("eth0"), None);
        let offloads = Offloads {
            tso: Some(false),
            gro: Some(true),
            checksum: Some(false),
            ..Default::default()
        };
        assert_eq!(
            offloads.command("eth0").unwrap(),
            "ethtool -K eth0 tso off gro on tx off rx off"
        );
    }

    #[test]
    fn ddio_masks() {
        assert_eq!(ddio_mask(2), 0x600);
        assert_eq!(ddio_mask(11), 0x7ff);
        assert_eq!(ddio_mask(1), 0x400);
        assert_eq!(ddio(2)[1], "wrmsr 0xc8b 0x600");
    }

    #[test]
    fn pinned_mode_clears_before_install() {
        let steps = irq_mode_steps("eth0", IrqMode::Pinned(Side::Receiver));
        let clear = steps.iter().position(|s| *s == Step::ClearRules).unwrap();
        let install = steps.iter().position(|s| *s == Step::InstallRules).unwrap();
        assert!(clear < install);
        assert!(steps.contains(&Step::Shell(
            "echo 0 > /proc/sys/net/core/rps_sock_flow_entries".to_owned()
        )));
    }

    #[test]
    fn arfs_mode_never_installs() {
        let steps = irq_mode_steps("eth0", IrqMode::Arfs);
        assert!(!steps.contains(&Step::InstallRules));
        assert_eq!(steps.last(), Some(&Step::ClearRules));
        assert!(steps.contains(&Step::Shell(
            "echo 32768 > /proc/sys/net/core/rps_sock_flow_entries".to_owned()
        )));
    }

    #[test]
    fn pinned_mode_installs_after_clearing() {
        let rules = planned(Side::Receiver);
        let mut nic = RecordingNic::default();
        let session = RuleTableSession::open(&mut nic, Capacity::new(2, 1));
        let shell = Shell { dry_run: true };
        let report = apply_irq_mode(shell, "eth0", IrqMode::Pinned(Side::Receiver), session, &rules)
            .unwrap()
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.installed, rules.len());
        let first_install = nic.calls.iter().position(|c| c.starts_with("install")).unwrap();
        let last_delete = nic.calls.iter().rposition(|c| c.starts_with("delete")).unwrap();
        assert!(last_delete < first_install);
    }

    #[test]
    fn arfs_mode_only_clears() {
        let mut nic = RecordingNic::default();
        let session = RuleTableSession::open(&mut nic, Capacity::new(2, 1));
        let shell = Shell { dry_run: true };
        let report = apply_irq_mode(shell, "eth0", IrqMode::Arfs, session, &planned(Side::Sender)).unwrap();
        assert!(report.is_none());
        assert!(!nic.calls.is_empty());
        assert!(nic.calls.iter().all(|c| c.starts_with("delete")));
    }
}
