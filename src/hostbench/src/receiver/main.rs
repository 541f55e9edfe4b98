// $ receiver --num-connections 4 --throughput --utilisation
use structopt::StructOpt;

use hostbench::argument::ReceiverOpts;
use hostbench::driver::ReceiverDriver;
use hostbench::process::ProcessPool;
use hostbench::sync::SyncServer;

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opts = ReceiverOpts::from_args();
    log::info!("options: {:?}", opts);

    let config = hostbench::config::load(opts.args.config.as_deref())?;
    opts.args.validate(&config)?;
    if let Some(dir) = &opts.args.output {
        std::fs::create_dir_all(dir)?;
    }

    let server = SyncServer::bind((opts.bind.as_str(), config.sync_port))?;

    let kinds = opts.args.experiments.kinds();
    let mut driver = ReceiverDriver::new(
        ProcessPool::new(),
        server.barrier(),
        config,
        opts.args.workload(),
        opts.args.output.clone(),
    );
    driver.start_listeners()?;
    let result = driver.run(&kinds).map(|_| ());
    driver.shutdown();

    print!("{}", driver.table().render());
    Ok(result?)
}
