//! Demo subscriber
//!
//! Attaches to the channel, answers every request with `request + increment`
//! and exits once the publisher stops.

use clap::Parser;
use shm_rendezvous::{ChannelError, Subscriber};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Answer integer requests over a shared memory channel")]
struct Args {
    /// Shared memory name of the channel
    #[arg(short, long, env = "SHM_RENDEZVOUS_NAME", default_value = "rendezvous_demo")]
    name: String,

    /// Added to every request to form the response
    #[arg(short, long, default_value_t = 1)]
    increment: i64,

    /// Keep retrying the attach for this long while the publisher sets up
    #[arg(long, default_value_t = 0)]
    wait_ms: u64,
}

fn main() -> ExitCode {
    shm_rendezvous::init_tracing();
    let args = Args::parse();

    let mut subscriber = match attach(&args.name, Duration::from_millis(args.wait_ms)) {
        Ok(s) => s,
        Err(e) => {
            error!("subscriber initialization failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(name = subscriber.name(), "subscriber started");

    if let Err(e) = serve(&mut subscriber, args.increment) {
        error!("subscriber failed: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = subscriber.destroy() {
        error!("subscriber teardown failed: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Attach, retrying only the failures a publisher still in setup produces
fn attach(name: &str, wait: Duration) -> shm_rendezvous::Result<Subscriber<i64, i64>> {
    let deadline = Instant::now() + wait;
    loop {
        match Subscriber::attach(name) {
            Ok(s) => return Ok(s),
            Err(
                ChannelError::ShmOpen { .. }
                | ChannelError::SizeMismatch { .. }
                | ChannelError::InvalidMagic { .. },
            ) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(e) => return Err(e),
        }
    }
}

fn serve(subscriber: &mut Subscriber<i64, i64>, increment: i64) -> shm_rendezvous::Result<()> {
    while let Some(request) = subscriber.subscribe()? {
        info!(request, "data received");
        let response = request + increment;
        subscriber.send_result(response)?;
        info!(response, "result sent");
    }

    info!("subscriber exiting");
    Ok(())
}
