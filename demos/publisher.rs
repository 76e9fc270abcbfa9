//! Demo publisher
//!
//! Creates the channel, publishes `step * i` for `i` in `1..=rounds`, prints
//! every result on stdout, then stops the subscriber and removes the channel.

use clap::Parser;
use shm_rendezvous::{ChannelConfig, Publisher};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Publish integer requests over a shared memory channel")]
struct Args {
    /// Shared memory name of the channel
    #[arg(short, long, env = "SHM_RENDEZVOUS_NAME", default_value = "rendezvous_demo")]
    name: String,

    /// Number of rounds to run
    #[arg(short, long, default_value_t = 5)]
    rounds: i64,

    /// Request for round i is step * i
    #[arg(short, long, default_value_t = 13)]
    step: i64,

    /// Remove a leftover channel with the same name first
    #[arg(long)]
    replace_stale: bool,
}

fn main() -> ExitCode {
    shm_rendezvous::init_tracing();
    let args = Args::parse();

    let config = ChannelConfig {
        replace_stale: args.replace_stale,
        ..ChannelConfig::default()
    };

    let mut publisher = match Publisher::<i64, i64>::create(&args.name, &config) {
        Ok(p) => p,
        Err(e) => {
            error!("publisher initialization failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(name = publisher.name(), "publisher started");

    match run(&mut publisher, &args) {
        Ok(()) => {}
        Err(e) => {
            error!("publisher failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = publisher.destroy() {
        error!("publisher teardown failed: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(publisher: &mut Publisher<i64, i64>, args: &Args) -> shm_rendezvous::Result<()> {
    for i in 1..=args.rounds {
        let request = args.step * i;
        publisher.publish(request)?;
        info!(request, "data published");

        let result = publisher.wait_for_result()?;
        info!(result, "result received");
        println!("{}", result);
    }

    publisher.stop()?;
    info!("publisher stopped");
    Ok(())
}
