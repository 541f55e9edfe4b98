// $ sender --receiver hostB --addr 10.0.0.2 --num-connections 4 --throughput --utilisation
use structopt::StructOpt;

use hostbench::argument::SenderOpts;
use hostbench::driver::Driver;
use hostbench::process::ProcessPool;
use hostbench::sync::SyncClient;
use litemsg::Node;

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opts = SenderOpts::from_args();
    log::info!("options: {:?}", opts);

    let config = hostbench::config::load(opts.args.config.as_deref())?;
    opts.args.validate(&config)?;
    if let Some(dir) = &opts.args.output {
        std::fs::create_dir_all(dir)?;
    }

    // the receiver may come up much later
    let node = Node::new(&opts.receiver, config.sync_port);
    let client = SyncClient::connect(&node, &config.retry)?;

    let kinds = opts.args.experiments.kinds();
    let mut driver = Driver::new(
        ProcessPool::new(),
        client,
        config,
        opts.args.workload(),
        &opts.addr,
        opts.args.output.clone(),
    )?;
    driver.clear_stale();
    let result = driver.run(&kinds).map(|_| ());

    // phases finished before a failure are still reported
    print!("{}", driver.table().render());
    Ok(result?)
}
