// $ netsetup eth0 --no-arfs --receiver --topology all-to-all --mtu 9000 --dca 4
use structopt::StructOpt;

use steering::config::{read_config, SteeringConfig};
use steering::setup::{self, IrqMode, Offloads, Shell};
use steering::{plan, Ethtool, PlanRequest, RuleTableSession, Side, TopologyMode};

#[derive(Debug, StructOpt)]
#[structopt(name = "netsetup", about = "Configure the network interface.")]
struct Opt {
    /// The network device interface to configure
    interface: String,

    /// This is the sender
    #[structopt(long)]
    sender: bool,

    /// This is the receiver
    #[structopt(long)]
    receiver: bool,

    /// Topology to steer flows for
    #[structopt(long, default_value = "one-to-one")]
    topology: TopologyMode,

    /// Testbed settings (cpus, ports, rpc capacity) in toml
    #[structopt(short = "c", long = "config")]
    config: Option<std::path::PathBuf>,

    /// MTU of the network interface (in bytes)
    #[structopt(long)]
    mtu: Option<u32>,

    /// Speed of the network interface (in Mbps)
    #[structopt(long)]
    speed: Option<u32>,

    /// Increase socket read/write memory limits
    #[structopt(long)]
    sock_size: bool,

    /// Set the number of cache ways DCA/DDIO can use
    #[structopt(long)]
    dca: Option<u32>,

    /// Set the size of the RX/TX ring buffer
    #[structopt(long)]
    ring_buffer: Option<u32>,

    #[structopt(long)]
    gro: bool,
    #[structopt(long, conflicts_with = "gro")]
    no_gro: bool,
    #[structopt(long)]
    gso: bool,
    #[structopt(long, conflicts_with = "gso")]
    no_gso: bool,
    #[structopt(long)]
    lro: bool,
    #[structopt(long, conflicts_with = "lro")]
    no_lro: bool,
    #[structopt(long)]
    tso: bool,
    #[structopt(long, conflicts_with = "tso")]
    no_tso: bool,
    /// Checksumming offloads
    #[structopt(long)]
    checksum: bool,
    #[structopt(long, conflicts_with = "checksum")]
    no_checksum: bool,

    /// Enables aRFS
    #[structopt(long)]
    arfs: bool,
    /// Disables aRFS and pins flows with ntuple rules
    #[structopt(long, conflicts_with = "arfs")]
    no_arfs: bool,

    /// Only print the commands
    #[structopt(long)]
    dry_run: bool,
}

fn tri(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Opt {
    fn validate(&self) -> anyhow::Result<()> {
        if let Some(dca) = self.dca {
            anyhow::ensure!((1..=11).contains(&dca), "Can't set --dca values outside of [1, 11].");
        }
        if let Some(mtu) = self.mtu {
            anyhow::ensure!(mtu > 0 && mtu <= 9000, "Can't set values of --mtu outside of (0, 9000] bytes.");
        }
        if let Some(speed) = self.speed {
            anyhow::ensure!(
                speed > 0 && speed <= 100000,
                "Can't set values of --speed outside of (0, 100000] Mbps."
            );
        }
        if let Some(ring) = self.ring_buffer {
            anyhow::ensure!(ring > 0 && ring <= 8192, "Can't set values of --ring-buffer outside of (0, 8192].");
        }
        anyhow::ensure!(
            !(self.no_checksum && self.tso),
            "Can't use --no-checksum with --tso, --no-checksum implies --no-tso."
        );
        if self.no_arfs {
            anyhow::ensure!(
                self.sender != self.receiver,
                "Must set exactly one of --sender or --receiver with --no-arfs."
            );
        }
        Ok(())
    }

    fn offloads(&self) -> Offloads {
        let checksum = tri(self.checksum, self.no_checksum);
        let tso = if checksum == Some(false) {
            Some(false)
        } else {
            tri(self.tso, self.no_tso)
        };
        Offloads {
            lro: tri(self.lro, self.no_lro),
            tso,
            gso: tri(self.gso, self.no_gso),
            gro: tri(self.gro, self.no_gro),
            checksum,
        }
    }

    fn irq_mode(&self) -> Option<IrqMode> {
        match tri(self.arfs, self.no_arfs)? {
            true => Some(IrqMode::Arfs),
            false if self.sender => Some(IrqMode::Pinned(Side::Sender)),
            false => Some(IrqMode::Pinned(Side::Receiver)),
        }
    }
}

fn setup_irq_mode(opt: &Opt, config: &SteeringConfig, shell: Shell, mode: IrqMode) -> steering::Result<()> {
    // plan first, a bad configuration must not touch the nic
    let rules = match mode {
        IrqMode::Arfs => Vec::new(),
        IrqMode::Pinned(side) => plan(&PlanRequest {
            side,
            mode: opt.topology,
            cpus: config.cpus.clone(),
            connections: config.max_connections(),
            rpc_count: config.max_rpcs,
            iperf_base: config.iperf_base_port,
            netperf_base: config.netperf_base_port,
            capacity: config.capacity(),
        })?,
    };

    let session = RuleTableSession::open(Ethtool::new(&opt.interface, opt.dry_run), config.capacity());
    setup::apply_irq_mode(shell, &opt.interface, mode, session, &rules)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opt = Opt::from_args();
    log::info!("options: {:?}", opt);
    opt.validate()?;

    let config: SteeringConfig = match &opt.config {
        Some(path) => read_config(path)?,
        None => Default::default(),
    };
    let shell = Shell { dry_run: opt.dry_run };
    let iface = &opt.interface;

    shell.run_all(opt.offloads().command(iface));

    if let Some(mode) = opt.irq_mode() {
        setup_irq_mode(&opt, &config, shell, mode)?;
    }

    shell.run_all(opt.speed.map(|s| setup::speed(iface, s)));
    shell.run_all(opt.mtu.map(|m| setup::mtu(iface, m)));
    if opt.sock_size {
        shell.run_all(Some(setup::sock_size()));
    }
    if let Some(ways) = opt.dca {
        shell.run_all(setup::ddio(ways));
    }
    shell.run_all(opt.ring_buffer.map(|r| setup::ring_buffer(iface, r)));

    Ok(())
}
