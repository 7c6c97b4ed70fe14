use std::time::Duration;

use clap::Parser;

use mav_offboard::cli::{Cli, FlightConfig};
use mav_offboard::mission;

// The link reader can stay blocked on a silent link
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = FlightConfig::from(Cli::parse());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Cannot start the async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(mission::run(&config));
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
