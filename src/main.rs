use std::process::exit;

use clap::Parser;
use log::error;

use rtain_net::{execute, CLI};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = CLI::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {:?}", e);
            exit(1);
        }
    };

    if let Err(e) = runtime.block_on(execute(cli)) {
        error!("{:?}", e);
        exit(1);
    }
}
